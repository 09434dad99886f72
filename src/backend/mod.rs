//! The services the terrain consumes from the surrounding engine.
//!
//! # Explanation
//! Terra never talks to a graphics API directly. It requests textures, constant buffers,
//! compute jobs and compositor workspaces through the four traits of this module, which
//! are handed to it as a [`RenderServices`] bundle at construction time.
//!
//! Every resource Terra creates is wrapped in an owner ([`OwnedTexture`],
//! [`OwnedConstBuffer`], [`OwnedWorkspace`]) that returns it to its manager when dropped.
//!
//! The handles are reference counted cells, which makes everything built on top of them
//! `!Send`: the terrain is driven from the rendering thread only.

pub mod headless;

use crate::error::TerraResult;
use bevy::{
    math::{UVec2, Vec2, Vec3, Vec4},
    render::render_resource::TextureFormat,
};
use derive_more::derive::{Display, From};
use std::{cell::RefCell, fmt, rc::Rc};

#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, From, Display)]
#[display("texture#{_0}")]
pub struct TextureId(pub usize);

#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, From, Display)]
#[display("buffer#{_0}")]
pub struct BufferId(pub usize);

#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, From, Display)]
#[display("job#{_0}")]
pub struct JobId(pub usize);

#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, From, Display)]
#[display("param#{_0}")]
pub struct ParamId(pub usize);

#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, From, Display)]
#[display("workspace#{_0}")]
pub struct WorkspaceId(pub usize);

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct TextureFlags: u32 {
        const NONE              = 0;
        /// Filled once from the CPU.
        const MANUAL_TEXTURE    = 1 << 0;
        const RENDER_TO_TEXTURE = 1 << 1;
        /// Writable from compute shaders.
        const UAV               = 1 << 2;
        const ALLOW_AUTOMIPMAPS = 1 << 3;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TextureDesc {
    pub name: String,
    pub size: UVec2,
    pub format: TextureFormat,
    pub flags: TextureFlags,
    pub mip_level_count: u32,
}

impl TextureDesc {
    pub fn new(name: impl Into<String>, size: UVec2, format: TextureFormat, flags: TextureFlags) -> Self {
        Self {
            name: name.into(),
            size,
            format,
            flags,
            mip_level_count: 1,
        }
    }

    pub fn with_full_mip_chain(mut self) -> Self {
        self.mip_level_count = max_mip_count(self.size);
        self
    }
}

/// The number of mip levels down to 1x1.
pub fn max_mip_count(size: UVec2) -> u32 {
    32 - size.x.max(size.y).max(1).leading_zeros()
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferType {
    Immutable,
    Dynamic,
    /// Stays mapped between writes.
    DynamicPersistent,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnmapOptions {
    KeepPersistent,
    UnmapAll,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MappingState {
    Unmapped,
    Mapped,
    MappedPersistent,
}

/// A manually set shader constant.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Int(i32),
    Uint(u32),
    Float(f32),
    Int2([i32; 2]),
    Float2(Vec2),
    Float3(Vec3),
    Float4(Vec4),
    /// At most four floats, the packing granularity of a constant slot.
    Floats(Vec<f32>),
}

pub trait TextureManager {
    fn create_texture(&mut self, desc: &TextureDesc) -> TerraResult<TextureId>;
    fn check_support(&self, format: TextureFormat, flags: TextureFlags) -> bool;
    /// Copies the tightly packed rows of mip 0 into the texture.
    fn upload(&mut self, texture: TextureId, data: &[u8]) -> TerraResult<()>;
    fn destroy_texture(&mut self, texture: TextureId);
}

pub trait ConstBufferManager {
    fn create_const_buffer(
        &mut self,
        size_bytes: usize,
        buffer_type: BufferType,
        initial_data: Option<&[u8]>,
    ) -> TerraResult<BufferId>;
    fn map(&mut self, buffer: BufferId, offset: usize, size: usize) -> TerraResult<&mut [u8]>;
    fn unmap(&mut self, buffer: BufferId, options: UnmapOptions);
    fn mapping_state(&self, buffer: BufferId) -> MappingState;
    fn destroy_const_buffer(&mut self, buffer: BufferId);
}

pub trait ComputeJobs {
    fn find_job(&self, name: &str) -> Option<JobId>;
    fn clone_job(&mut self, job: JobId, new_name: &str) -> TerraResult<JobId>;
    fn property(&self, job: JobId, key: &str) -> Option<i32>;
    fn set_property(&mut self, job: JobId, key: &str, value: i32);
    fn threads_per_group(&self, job: JobId) -> [u32; 3];
    fn find_parameter(&self, job: JobId, name: &str) -> Option<ParamId>;
    fn set_manual_value(&mut self, job: JobId, param: ParamId, value: ParamValue);
    fn add_parameter(&mut self, job: JobId, name: &str, value: ParamValue) -> ParamId;
    fn remove_parameters_with_prefix(&mut self, job: JobId, prefix: &str);
    fn set_const_buffer(&mut self, job: JobId, slot: u8, buffer: BufferId);
    fn set_texture(&mut self, job: JobId, slot: u8, texture: TextureId);
    fn set_num_thread_groups(&mut self, job: JobId, groups: [u32; 3]);
    fn set_params_dirty(&mut self, job: JobId);
}

pub trait Compositor {
    fn add_workspace(&mut self, definition: &str, channels: &[TextureId]) -> TerraResult<WorkspaceId>;
    /// Records the workspace's passes. Completion is not awaited.
    fn update_workspace(&mut self, workspace: WorkspaceId);
    fn remove_workspace(&mut self, workspace: WorkspaceId);
}

pub type SharedTextureManager = Rc<RefCell<dyn TextureManager>>;
pub type SharedConstBufferManager = Rc<RefCell<dyn ConstBufferManager>>;
pub type SharedComputeJobs = Rc<RefCell<dyn ComputeJobs>>;
pub type SharedCompositor = Rc<RefCell<dyn Compositor>>;

/// The collaborators injected into [`Terra`](crate::terra::Terra) and
/// [`ShadowMapper`](crate::shadow::ShadowMapper).
#[derive(Clone)]
pub struct RenderServices {
    pub textures: SharedTextureManager,
    pub buffers: SharedConstBufferManager,
    pub compute: SharedComputeJobs,
    pub compositor: SharedCompositor,
}

impl RenderServices {
    /// Uses one object for all four services.
    pub fn from_backend<B>(backend: Rc<RefCell<B>>) -> Self
    where
        B: TextureManager + ConstBufferManager + ComputeJobs + Compositor + 'static,
    {
        Self {
            textures: backend.clone(),
            buffers: backend.clone(),
            compute: backend.clone(),
            compositor: backend,
        }
    }
}

impl fmt::Debug for RenderServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderServices").finish_non_exhaustive()
    }
}

/// A texture destroyed together with its owner.
pub struct OwnedTexture {
    id: TextureId,
    desc: TextureDesc,
    manager: SharedTextureManager,
}

impl OwnedTexture {
    pub fn create(manager: &SharedTextureManager, desc: TextureDesc) -> TerraResult<Self> {
        let id = manager.borrow_mut().create_texture(&desc)?;

        Ok(Self {
            id,
            desc,
            manager: manager.clone(),
        })
    }

    pub fn upload(&self, data: &[u8]) -> TerraResult<()> {
        self.manager.borrow_mut().upload(self.id, data)
    }

    #[inline]
    pub fn id(&self) -> TextureId {
        self.id
    }

    #[inline]
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    #[inline]
    pub fn size(&self) -> UVec2 {
        self.desc.size
    }

    #[inline]
    pub fn format(&self) -> TextureFormat {
        self.desc.format
    }
}

impl Drop for OwnedTexture {
    fn drop(&mut self) {
        self.manager.borrow_mut().destroy_texture(self.id);
    }
}

impl fmt::Debug for OwnedTexture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedTexture")
            .field("id", &self.id)
            .field("desc", &self.desc)
            .finish()
    }
}

/// A constant buffer destroyed together with its owner.
pub struct OwnedConstBuffer {
    id: BufferId,
    size: usize,
    manager: SharedConstBufferManager,
}

impl OwnedConstBuffer {
    pub fn create(
        manager: &SharedConstBufferManager,
        size: usize,
        buffer_type: BufferType,
    ) -> TerraResult<Self> {
        let id = manager
            .borrow_mut()
            .create_const_buffer(size, buffer_type, None)?;

        Ok(Self {
            id,
            size,
            manager: manager.clone(),
        })
    }

    /// Maps the buffer, copies `bytes` to its start and unmaps it again, keeping the
    /// persistent mapping alive.
    ///
    /// The GPU only reads the contents once the following workspace update is submitted.
    pub fn write(&self, bytes: &[u8]) -> TerraResult<()> {
        assert!(bytes.len() <= self.size, "write exceeds the buffer size");

        let mut manager = self.manager.borrow_mut();
        manager.map(self.id, 0, bytes.len())?.copy_from_slice(bytes);
        manager.unmap(self.id, UnmapOptions::KeepPersistent);

        Ok(())
    }

    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for OwnedConstBuffer {
    fn drop(&mut self) {
        let mut manager = self.manager.borrow_mut();

        if manager.mapping_state(self.id) != MappingState::Unmapped {
            manager.unmap(self.id, UnmapOptions::UnmapAll);
        }
        manager.destroy_const_buffer(self.id);
    }
}

impl fmt::Debug for OwnedConstBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedConstBuffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

/// A compositor workspace removed together with its owner.
pub struct OwnedWorkspace {
    id: WorkspaceId,
    compositor: SharedCompositor,
}

impl OwnedWorkspace {
    pub fn create(
        compositor: &SharedCompositor,
        definition: &str,
        channels: &[TextureId],
    ) -> TerraResult<Self> {
        let id = compositor
            .borrow_mut()
            .add_workspace(definition, channels)?;

        Ok(Self {
            id,
            compositor: compositor.clone(),
        })
    }

    pub fn update(&self) {
        self.compositor.borrow_mut().update_workspace(self.id);
    }

    #[inline]
    pub fn id(&self) -> WorkspaceId {
        self.id
    }
}

impl Drop for OwnedWorkspace {
    fn drop(&mut self) {
        self.compositor.borrow_mut().remove_workspace(self.id);
    }
}

impl fmt::Debug for OwnedWorkspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedWorkspace")
            .field("id", &self.id)
            .finish()
    }
}
