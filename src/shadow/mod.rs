//! Ray marched heightmap shadows.
//!
//! # Explanation
//! The [`ShadowMapper`] owns the shadow map texture of one terrain and the compute
//! resources that fill it. Whenever the light direction changes it partitions the
//! heightmap into parallel Bresenham lines (see [`partition`]), uploads their starts
//! and per group data, and lets the compositor run the shadow generator followed by a
//! separable gaussian blur (see [`gaussian`]).

pub mod gaussian;
pub mod partition;

use crate::{
    backend::{
        BufferType, ComputeJobs, JobId, OwnedConstBuffer, OwnedTexture, OwnedWorkspace, ParamId,
        ParamValue, RenderServices, TextureDesc, TextureFlags, TextureId, WorkspaceId,
    },
    config::GaussianConfig,
    error::{TerraError, TerraResult},
    shared_resources::{SharedResourcesHandle, TempTexture, TemporaryUsage, TerraSharedResources},
};
use bevy::{
    log::{debug, info},
    math::{UVec2, Vec2, Vec3},
    render::render_resource::TextureFormat,
};
use gaussian::{gaussian_weights, upload_gaussian_weights};
use partition::{MarchParams, ShadowPartition, PER_GROUP_BUFFER_SIZE, STARTS_BUFFER_SIZE};

pub const SHADOW_GENERATOR_JOB: &str = "Terra/ShadowGenerator";
pub const SHADOW_GENERATOR_U16_JOB: &str = "Terra/ShadowGeneratorU16";
pub const SHADOW_GENERATOR_WORKSPACE: &str = "Terra/ShadowGeneratorWorkspace";
pub const SHADOW_GENERATOR_U16_WORKSPACE: &str = "Terra/ShadowGeneratorWorkspaceU16";
pub const GAUSSIAN_BLUR_JOBS: [&str; 2] = ["Terra/GaussianBlurH", "Terra/GaussianBlurV"];

/// The largest heightmap side the starts and per group buffers can partition.
pub const MAX_SHADOW_MAP_RESOLUTION: u32 = 4096;

const USE_UINT_PROPERTY: &str = "terra_use_uint";

/// Tried in order. `Rgba8Unorm` is the fallback when none of them supports UAV writes.
const PREFERRED_SHADOW_FORMATS: [TextureFormat; 3] = [
    TextureFormat::Rgb10a2Unorm,
    TextureFormat::Rgba16Unorm,
    TextureFormat::Rgba16Float,
];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShadowMapperState {
    Uninitialized,
    Created,
    Destroyed,
}

/// The values sent to the shadow generator by the last update.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShadowParams {
    pub march: MarchParams,
    /// Height change of the light ray per march step, normalized by the terrain height.
    pub height_delta: f32,
    pub resolution_shift: u32,
    pub thread_groups: u32,
}

struct JobParams {
    delta: ParamId,
    xy_step: ParamId,
    is_steep: ParamId,
    height_delta: ParamId,
    resolution_shift: ParamId,
}

impl JobParams {
    fn find(compute: &dyn ComputeJobs, job: JobId, job_name: &str) -> TerraResult<Self> {
        let find = |name: &str| {
            compute
                .find_parameter(job, name)
                .ok_or_else(|| TerraError::ShaderParamNotFound {
                    job: job_name.to_string(),
                    param: name.to_string(),
                })
        };

        Ok(Self {
            delta: find("delta")?,
            xy_step: find("xyStep")?,
            is_steep: find("isSteep")?,
            height_delta: find("heightDelta")?,
            resolution_shift: find("resolutionShift")?,
        })
    }
}

struct ShadowResources {
    job: JobId,
    params: JobParams,
    workspace_definition: &'static str,
    height_map: TextureId,
    /// The lines are marched over the heightmap, not the shadow map.
    height_map_size: UVec2,
    low_res: bool,
    starts: OwnedConstBuffer,
    per_group: OwnedConstBuffer,
    shadow_map: OwnedTexture,
}

struct ShadowWorkspace {
    workspace: OwnedWorkspace,
    // the blur's ping-pong target, released after the workspace
    _tmp_shadows: TempTexture,
}

fn create_workspace(
    services: &RenderServices,
    shared: Option<&SharedResourcesHandle>,
    terra_id: u32,
    resources: &ShadowResources,
) -> TerraResult<ShadowWorkspace> {
    let tmp_shadows = TerraSharedResources::get_temp_texture(
        "Terra tmpShadows",
        terra_id,
        shared,
        TemporaryUsage::TmpShadows,
        resources.shadow_map.desc(),
        TextureFlags::UAV,
        &services.textures,
    )?;

    let workspace = OwnedWorkspace::create(
        &services.compositor,
        resources.workspace_definition,
        &[resources.shadow_map.id(), tmp_shadows.id()],
    )?;

    Ok(ShadowWorkspace {
        workspace,
        _tmp_shadows: tmp_shadows,
    })
}

fn apply_gaussian_filter(
    services: &RenderServices,
    kernel_radius: u8,
    deviation_factor: f32,
) -> TerraResult<()> {
    let weights = gaussian_weights(kernel_radius, deviation_factor);
    let mut compute = services.compute.borrow_mut();

    for name in GAUSSIAN_BLUR_JOBS {
        let job = compute
            .find_job(name)
            .ok_or_else(|| TerraError::ComputeJobNotFound(name.to_string()))?;
        upload_gaussian_weights(&mut *compute, job, kernel_radius, &weights);
    }

    Ok(())
}

/// Bakes the shadows of one terrain.
pub struct ShadowMapper {
    services: RenderServices,
    shared_resources: Option<SharedResourcesHandle>,
    blur: GaussianConfig,
    terra_id: u32,
    minimize_memory_consumption: bool,
    state: ShadowMapperState,
    last_params: Option<ShadowParams>,
    // declared before the resources it renders into
    workspace: Option<ShadowWorkspace>,
    resources: Option<ShadowResources>,
}

impl ShadowMapper {
    pub fn new(services: RenderServices, blur: GaussianConfig) -> Self {
        Self {
            services,
            shared_resources: None,
            blur,
            terra_id: 0,
            minimize_memory_consumption: false,
            state: ShadowMapperState::Uninitialized,
            last_params: None,
            workspace: None,
            resources: None,
        }
    }

    /// Allocates the shadow map for `height_map`, replacing any previous one.
    ///
    /// Fails without leaving a partially created shadow map behind.
    pub fn create_shadow_map(
        &mut self,
        terra_id: u32,
        height_map: &OwnedTexture,
        low_res_shadow: bool,
    ) -> TerraResult<()> {
        self.destroy_shadow_map();
        self.blur.validate()?;

        let height_map_size = height_map.size();
        if height_map_size.max_element() > MAX_SHADOW_MAP_RESOLUTION {
            return Err(TerraError::HeightmapTooLarge {
                size: height_map_size.max_element(),
                max: MAX_SHADOW_MAP_RESOLUTION,
            });
        }

        let starts = OwnedConstBuffer::create(
            &self.services.buffers,
            STARTS_BUFFER_SIZE,
            BufferType::DynamicPersistent,
        )?;
        let per_group = OwnedConstBuffer::create(
            &self.services.buffers,
            PER_GROUP_BUFFER_SIZE,
            BufferType::DynamicPersistent,
        )?;

        let use_u16 = height_map.format() == TextureFormat::R16Uint;
        let (job_name, workspace_definition) = if use_u16 {
            (SHADOW_GENERATOR_U16_JOB, SHADOW_GENERATOR_U16_WORKSPACE)
        } else {
            (SHADOW_GENERATOR_JOB, SHADOW_GENERATOR_WORKSPACE)
        };
        let job = self.find_shadow_job(use_u16)?;
        let params = JobParams::find(&*self.services.compute.borrow(), job, job_name)?;

        let shadow_size = if low_res_shadow {
            (height_map_size >> 2u32).max(UVec2::ONE)
        } else {
            height_map_size
        };
        let shadow_map = OwnedTexture::create(
            &self.services.textures,
            TextureDesc::new(
                format!("ShadowMap{terra_id}"),
                shadow_size,
                self.shadow_map_format(),
                TextureFlags::UAV,
            ),
        )?;

        let resources = ShadowResources {
            job,
            params,
            workspace_definition,
            height_map: height_map.id(),
            height_map_size,
            low_res: low_res_shadow,
            starts,
            per_group,
            shadow_map,
        };

        let workspace = if self.minimize_memory_consumption {
            None
        } else {
            Some(create_workspace(
                &self.services,
                self.shared_resources.as_ref(),
                terra_id,
                &resources,
            )?)
        };

        apply_gaussian_filter(
            &self.services,
            self.blur.kernel_radius(low_res_shadow),
            self.blur.deviation_factor,
        )?;

        info!(
            "Created shadow map {} ({:?} {}) for terra {terra_id}.",
            resources.shadow_map.desc().name,
            resources.shadow_map.format(),
            shadow_size
        );

        self.terra_id = terra_id;
        self.workspace = workspace;
        self.resources = Some(resources);
        self.state = ShadowMapperState::Created;

        Ok(())
    }

    /// Releases the shadow map, its buffers and its workspace.
    pub fn destroy_shadow_map(&mut self) {
        self.workspace = None;
        self.last_params = None;

        if self.resources.take().is_some() {
            self.state = ShadowMapperState::Destroyed;
        }
    }

    /// Re-bakes the shadows for `light_dir` (Y-up).
    ///
    /// `xz_dimensions` is the world size of the terrain and `height_scale` its height.
    pub fn update_shadow_map(
        &mut self,
        light_dir: Vec3,
        xz_dimensions: Vec2,
        height_scale: f32,
    ) -> TerraResult<()> {
        let resources = self
            .resources
            .as_ref()
            .ok_or(TerraError::ShadowMapNotCreated)?;

        if self.workspace.is_none() {
            self.workspace = Some(create_workspace(
                &self.services,
                self.shared_resources.as_ref(),
                self.terra_id,
                resources,
            )?);
        }

        let size = resources.height_map_size;
        let threads_per_group = self.services.compute.borrow().threads_per_group(resources.job)[0];
        let partition = ShadowPartition::compute(
            size.x,
            size.y,
            Vec2::new(light_dir.x, light_dir.z),
            threads_per_group,
        )?;

        let march = partition.params;
        let (major_component, texel_size) = if march.steep {
            (light_dir.z, xz_dimensions.y / size.y as f32)
        } else {
            (light_dir.x, xz_dimensions.x / size.x as f32)
        };
        let height_delta =
            -light_dir.y / major_component.abs().max(f32::MIN_POSITIVE) * texel_size / height_scale;
        let height_delta = if height_delta.is_nan() {
            0.0
        } else {
            height_delta.clamp(-1.0, 1.0)
        };

        let shadow_params = ShadowParams {
            march,
            height_delta,
            resolution_shift: if resources.low_res { 2 } else { 0 },
            thread_groups: partition.thread_group_count(),
        };

        {
            let mut compute = self.services.compute.borrow_mut();
            let (job, params) = (resources.job, &resources.params);

            compute.set_manual_value(job, params.delta, ParamValue::Float2(march.delta));
            compute.set_manual_value(job, params.xy_step, ParamValue::Int2(march.xy_step));
            compute.set_manual_value(job, params.is_steep, ParamValue::Int(i32::from(march.steep)));
            compute.set_manual_value(job, params.height_delta, ParamValue::Float(height_delta));
            compute.set_manual_value(
                job,
                params.resolution_shift,
                ParamValue::Uint(shadow_params.resolution_shift),
            );
            compute.set_params_dirty(job);
        }

        resources
            .starts
            .write(bytemuck::cast_slice(&partition.starts_buffer()))?;
        resources
            .per_group
            .write(bytemuck::cast_slice(&partition.groups))?;

        {
            let mut compute = self.services.compute.borrow_mut();
            let job = resources.job;

            compute.set_const_buffer(job, 0, resources.starts.id());
            compute.set_const_buffer(job, 1, resources.per_group.id());
            compute.set_texture(job, 0, resources.height_map);
            compute.set_num_thread_groups(job, [shadow_params.thread_groups, 1, 1]);
        }

        if let Some(workspace) = &self.workspace {
            workspace.workspace.update();
        }

        if self.minimize_memory_consumption {
            self.workspace = None;
        }

        debug!(
            "Dispatched {} shadow thread groups for terra {}.",
            shadow_params.thread_groups, self.terra_id
        );

        self.last_params = Some(shadow_params);

        Ok(())
    }

    /// Uploads new blur weights to both blur passes.
    pub fn set_gaussian_filter_params(
        &mut self,
        kernel_radius: u8,
        deviation_factor: f32,
    ) -> TerraResult<()> {
        let blur = GaussianConfig {
            kernel_radius: Some(kernel_radius),
            deviation_factor,
        };
        blur.validate()?;

        apply_gaussian_filter(&self.services, kernel_radius, deviation_factor)?;
        self.blur = blur;

        Ok(())
    }

    /// Keeps the workspace only for the duration of each update when enabled.
    pub fn set_minimize_memory_consumption(&mut self, minimize: bool) -> TerraResult<()> {
        self.minimize_memory_consumption = minimize;

        if minimize {
            self.workspace = None;
        } else if self.workspace.is_none() {
            self.rebuild_workspace()?;
        }

        Ok(())
    }

    /// Switches the cache temporary textures come from, rebuilding the workspace.
    pub fn set_shared_resources(
        &mut self,
        shared_resources: Option<SharedResourcesHandle>,
    ) -> TerraResult<()> {
        self.workspace = None;
        self.shared_resources = shared_resources;

        if !self.minimize_memory_consumption {
            self.rebuild_workspace()?;
        }

        Ok(())
    }

    fn rebuild_workspace(&mut self) -> TerraResult<()> {
        self.workspace = None;

        if let Some(resources) = &self.resources {
            self.workspace = Some(create_workspace(
                &self.services,
                self.shared_resources.as_ref(),
                self.terra_id,
                resources,
            )?);
        }

        Ok(())
    }

    pub fn shadow_map_texture(&self) -> Option<TextureId> {
        self.resources
            .as_ref()
            .map(|resources| resources.shadow_map.id())
    }

    pub fn shadow_map_desc(&self) -> Option<&TextureDesc> {
        self.resources
            .as_ref()
            .map(|resources| resources.shadow_map.desc())
    }

    pub fn job(&self) -> Option<JobId> {
        self.resources.as_ref().map(|resources| resources.job)
    }

    pub fn workspace(&self) -> Option<WorkspaceId> {
        self.workspace
            .as_ref()
            .map(|workspace| workspace.workspace.id())
    }

    #[inline]
    pub fn state(&self) -> ShadowMapperState {
        self.state
    }

    #[inline]
    pub fn last_params(&self) -> Option<&ShadowParams> {
        self.last_params.as_ref()
    }

    #[inline]
    pub fn minimize_memory_consumption(&self) -> bool {
        self.minimize_memory_consumption
    }

    fn find_shadow_job(&self, use_u16: bool) -> TerraResult<JobId> {
        let mut compute = self.services.compute.borrow_mut();

        let base = compute
            .find_job(SHADOW_GENERATOR_JOB)
            .ok_or_else(|| TerraError::ComputeJobNotFound(SHADOW_GENERATOR_JOB.to_string()))?;

        if !use_u16 {
            return Ok(base);
        }

        if let Some(job) = compute.find_job(SHADOW_GENERATOR_U16_JOB) {
            return Ok(job);
        }

        let job = compute.clone_job(base, SHADOW_GENERATOR_U16_JOB)?;
        compute.set_property(job, USE_UINT_PROPERTY, 1);

        Ok(job)
    }

    fn shadow_map_format(&self) -> TextureFormat {
        let textures = self.services.textures.borrow();

        PREFERRED_SHADOW_FORMATS
            .into_iter()
            .find(|&format| textures.check_support(format, TextureFlags::UAV))
            .unwrap_or(TextureFormat::Rgba8Unorm)
    }
}
