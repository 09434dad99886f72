//! Scratch textures shared between all terrains of a scene.

use crate::{
    backend::{OwnedTexture, SharedTextureManager, TextureDesc, TextureFlags, TextureId},
    error::TerraResult,
};
use bevy::log::debug;
use std::{cell::RefCell, rc::Rc};

/// The purposes temporary textures are requested for.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum TemporaryUsage {
    /// Render target of the normal map generation. Only needed while loading.
    TmpNormalMap,
    /// Ping-pong target of the shadow blur.
    TmpShadows,
}

impl TemporaryUsage {
    pub const COUNT: usize = 2;
}

pub type SharedResourcesHandle = Rc<RefCell<TerraSharedResources>>;

/// A temporary texture handed out by [`TerraSharedResources::get_temp_texture`].
///
/// Dropping it destroys the texture unless the shared resources keep it cached.
#[derive(Debug)]
pub enum TempTexture {
    Cached(TextureId),
    Owned(OwnedTexture),
}

impl TempTexture {
    pub fn id(&self) -> TextureId {
        match self {
            TempTexture::Cached(id) => *id,
            TempTexture::Owned(texture) => texture.id(),
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, TempTexture::Cached(_))
    }
}

/// Caches one texture per [`TemporaryUsage`].
#[derive(Debug, Default)]
pub struct TerraSharedResources {
    textures: [Option<OwnedTexture>; TemporaryUsage::COUNT],
}

impl TerraSharedResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> SharedResourcesHandle {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Destroys every cached texture.
    pub fn free_all_memory(&mut self) {
        self.textures = Default::default();
    }

    /// Destroys the textures that are only needed while loading a terrain.
    pub fn free_static_memory(&mut self) {
        self.textures[TemporaryUsage::TmpNormalMap as usize] = None;
    }

    pub fn cached(&self, usage: TemporaryUsage) -> Option<TextureId> {
        self.textures[usage as usize].as_ref().map(OwnedTexture::id)
    }

    /// Returns a texture with the size and format of `base`.
    ///
    /// With shared resources the texture of `usage` is reused when it matches, and
    /// replaced otherwise. Without them a new texture is created for the caller.
    pub fn get_temp_texture(
        name: &str,
        terra_id: u32,
        shared: Option<&SharedResourcesHandle>,
        usage: TemporaryUsage,
        base: &TextureDesc,
        flags: TextureFlags,
        textures: &SharedTextureManager,
    ) -> TerraResult<TempTexture> {
        let desc = TextureDesc {
            name: format!("{name}{terra_id}"),
            size: base.size,
            format: base.format,
            flags,
            mip_level_count: 1,
        };

        let Some(shared) = shared else {
            return Ok(TempTexture::Owned(OwnedTexture::create(textures, desc)?));
        };

        let mut shared = shared.borrow_mut();
        let slot = &mut shared.textures[usage as usize];

        if let Some(texture) = slot.as_ref().filter(|texture| {
            let cached = texture.desc();
            cached.size == desc.size && cached.format == desc.format && cached.flags == desc.flags
        }) {
            return Ok(TempTexture::Cached(texture.id()));
        }

        // the old texture has to go before the new one is allocated
        *slot = None;
        let texture = OwnedTexture::create(textures, desc)?;
        let id = texture.id();
        *slot = Some(texture);

        debug!("Cached new temporary texture for {usage:?}.");

        Ok(TempTexture::Cached(id))
    }
}
