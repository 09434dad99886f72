//! A backend without a GPU. It keeps every resource in memory and records what was
//! asked of it, so the terrain can be driven and inspected in tests and tools.

use crate::{
    backend::*,
    error::{TerraError, TerraResult},
};
use bevy::{
    log::debug,
    math::UVec2,
    render::render_resource::TextureFormat,
    utils::{HashMap, HashSet},
};
use slab::Slab;

/// The job definitions the terrain expects to find, with their tunable parameters.
pub const TERRA_JOBS: [(&str, &[&str]); 4] = [
    (
        "Terra/ShadowGenerator",
        &["delta", "xyStep", "isSteep", "heightDelta", "resolutionShift"],
    ),
    ("Terra/GaussianBlurH", &[]),
    ("Terra/GaussianBlurV", &[]),
    ("Terra/GpuNormalMapper", &["heightMapResolution", "vScale"]),
];

#[derive(Clone, Debug)]
pub struct HeadlessTexture {
    pub desc: TextureDesc,
    pub data: Vec<u8>,
    pub uploads: u32,
}

#[derive(Clone, Debug)]
pub struct HeadlessBuffer {
    pub buffer_type: BufferType,
    pub data: Vec<u8>,
    pub state: MappingState,
}

#[derive(Clone, Debug)]
pub struct HeadlessJob {
    pub name: String,
    pub properties: HashMap<String, i32>,
    pub params: Slab<(String, ParamValue)>,
    pub threads_per_group: [u32; 3],
    pub const_buffers: HashMap<u8, BufferId>,
    pub textures: HashMap<u8, TextureId>,
    pub thread_groups: [u32; 3],
    pub dirty: bool,
}

impl HeadlessJob {
    fn new(name: &str, threads_per_group: [u32; 3]) -> Self {
        Self {
            name: name.to_string(),
            properties: HashMap::default(),
            params: Slab::new(),
            threads_per_group,
            const_buffers: HashMap::default(),
            textures: HashMap::default(),
            thread_groups: [0; 3],
            dirty: false,
        }
    }

    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params
            .iter()
            .find(|(_, (param, _))| param == name)
            .map(|(_, (_, value))| value)
    }
}

#[derive(Clone, Debug)]
pub struct HeadlessWorkspace {
    pub definition: String,
    pub channels: Vec<TextureId>,
    pub updates: u32,
}

/// Implements all four collaborator traits.
#[derive(Debug)]
pub struct HeadlessBackend {
    textures: Slab<HeadlessTexture>,
    buffers: Slab<HeadlessBuffer>,
    jobs: Slab<HeadlessJob>,
    job_names: HashMap<String, JobId>,
    workspaces: Slab<HeadlessWorkspace>,
    unsupported_formats: HashSet<TextureFormat>,
    max_texture_size: u32,
    workspace_updates: Vec<String>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    /// An empty backend without any registered compute jobs.
    pub fn new() -> Self {
        Self {
            textures: Slab::new(),
            buffers: Slab::new(),
            jobs: Slab::new(),
            job_names: HashMap::default(),
            workspaces: Slab::new(),
            unsupported_formats: HashSet::default(),
            max_texture_size: 16384,
            workspace_updates: Vec::new(),
        }
    }

    /// A backend with the terrain's compute jobs registered, running 64 threads per group.
    pub fn with_terra_jobs() -> Self {
        let mut backend = Self::new();

        for (name, params) in TERRA_JOBS {
            backend.register_job(name, [64, 1, 1], params);
        }

        backend
    }

    pub fn register_job(&mut self, name: &str, threads_per_group: [u32; 3], params: &[&str]) -> JobId {
        let mut job = HeadlessJob::new(name, threads_per_group);
        for param in params {
            job.params.insert((param.to_string(), ParamValue::Float(0.0)));
        }

        let id = JobId(self.jobs.insert(job));
        self.job_names.insert(name.to_string(), id);
        id
    }

    /// Makes [`TextureManager::check_support`] reject the format.
    pub fn disable_format(&mut self, format: TextureFormat) {
        self.unsupported_formats.insert(format);
    }

    pub fn set_max_texture_size(&mut self, size: u32) {
        self.max_texture_size = size;
    }

    pub fn texture(&self, texture: TextureId) -> &HeadlessTexture {
        &self.textures[texture.0]
    }

    pub fn textures(&self) -> impl Iterator<Item = (TextureId, &HeadlessTexture)> {
        self.textures.iter().map(|(key, texture)| (TextureId(key), texture))
    }

    pub fn buffer_data(&self, buffer: BufferId) -> &[u8] {
        &self.buffers[buffer.0].data
    }

    pub fn job(&self, job: JobId) -> &HeadlessJob {
        &self.jobs[job.0]
    }

    pub fn job_by_name(&self, name: &str) -> Option<&HeadlessJob> {
        self.job_names.get(name).map(|&id| self.job(id))
    }

    pub fn workspace(&self, workspace: WorkspaceId) -> &HeadlessWorkspace {
        &self.workspaces[workspace.0]
    }

    pub fn workspaces(&self) -> impl Iterator<Item = &HeadlessWorkspace> {
        self.workspaces.iter().map(|(_, workspace)| workspace)
    }

    /// The definitions of all updated workspaces, in update order.
    pub fn workspace_updates(&self) -> &[String] {
        &self.workspace_updates
    }

    pub fn live_texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_workspace_count(&self) -> usize {
        self.workspaces.len()
    }
}

fn bytes_per_pixel(format: TextureFormat) -> TerraResult<usize> {
    Ok(match format {
        TextureFormat::R8Unorm => 1,
        TextureFormat::R16Unorm | TextureFormat::R16Uint => 2,
        TextureFormat::R32Float
        | TextureFormat::Rgb10a2Unorm
        | TextureFormat::Rgba8Unorm => 4,
        TextureFormat::Rgba16Unorm | TextureFormat::Rgba16Float => 8,
        _ => return Err(TerraError::FormatNotSupported(format)),
    })
}

impl TextureManager for HeadlessBackend {
    fn create_texture(&mut self, desc: &TextureDesc) -> TerraResult<TextureId> {
        if !self.check_support(desc.format, desc.flags) {
            return Err(TerraError::FormatNotSupported(desc.format));
        }
        if desc.size.cmpeq(UVec2::ZERO).any() || desc.size.max_element() > self.max_texture_size {
            return Err(TerraError::Backend(format!(
                "invalid texture size {} for {}",
                desc.size, desc.name
            )));
        }

        let size = desc.size.x as usize * desc.size.y as usize * bytes_per_pixel(desc.format)?;
        let id = self.textures.insert(HeadlessTexture {
            desc: desc.clone(),
            data: vec![0; size],
            uploads: 0,
        });

        debug!("Created texture {} ({:?} {}).", desc.name, desc.format, desc.size);

        Ok(TextureId(id))
    }

    fn check_support(&self, format: TextureFormat, _flags: TextureFlags) -> bool {
        bytes_per_pixel(format).is_ok() && !self.unsupported_formats.contains(&format)
    }

    fn upload(&mut self, texture: TextureId, data: &[u8]) -> TerraResult<()> {
        let texture = self
            .textures
            .get_mut(texture.0)
            .ok_or_else(|| TerraError::Backend(format!("unknown {texture}")))?;

        if texture.data.len() != data.len() {
            return Err(TerraError::Backend(format!(
                "upload of {} bytes into {} ({} bytes)",
                data.len(),
                texture.desc.name,
                texture.data.len()
            )));
        }

        texture.data.copy_from_slice(data);
        texture.uploads += 1;

        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.try_remove(texture.0);
    }
}

impl ConstBufferManager for HeadlessBackend {
    fn create_const_buffer(
        &mut self,
        size_bytes: usize,
        buffer_type: BufferType,
        initial_data: Option<&[u8]>,
    ) -> TerraResult<BufferId> {
        let mut data = vec![0; size_bytes];
        if let Some(initial_data) = initial_data {
            data[..initial_data.len()].copy_from_slice(initial_data);
        }

        Ok(BufferId(self.buffers.insert(HeadlessBuffer {
            buffer_type,
            data,
            state: MappingState::Unmapped,
        })))
    }

    fn map(&mut self, buffer: BufferId, offset: usize, size: usize) -> TerraResult<&mut [u8]> {
        let buffer = self
            .buffers
            .get_mut(buffer.0)
            .ok_or_else(|| TerraError::Backend(format!("unknown {buffer}")))?;

        if buffer.buffer_type == BufferType::Immutable {
            return Err(TerraError::Backend("cannot map an immutable buffer".into()));
        }
        if offset + size > buffer.data.len() {
            return Err(TerraError::Backend(format!(
                "mapping {size} bytes at {offset} exceeds the buffer size {}",
                buffer.data.len()
            )));
        }

        buffer.state = MappingState::Mapped;
        Ok(&mut buffer.data[offset..offset + size])
    }

    fn unmap(&mut self, buffer: BufferId, options: UnmapOptions) {
        if let Some(buffer) = self.buffers.get_mut(buffer.0) {
            buffer.state = match (options, buffer.buffer_type) {
                (UnmapOptions::KeepPersistent, BufferType::DynamicPersistent) => {
                    MappingState::MappedPersistent
                }
                _ => MappingState::Unmapped,
            };
        }
    }

    fn mapping_state(&self, buffer: BufferId) -> MappingState {
        self.buffers
            .get(buffer.0)
            .map_or(MappingState::Unmapped, |buffer| buffer.state)
    }

    fn destroy_const_buffer(&mut self, buffer: BufferId) {
        self.buffers.try_remove(buffer.0);
    }
}

impl ComputeJobs for HeadlessBackend {
    fn find_job(&self, name: &str) -> Option<JobId> {
        self.job_names.get(name).copied()
    }

    fn clone_job(&mut self, job: JobId, new_name: &str) -> TerraResult<JobId> {
        if self.job_names.contains_key(new_name) {
            return Err(TerraError::Backend(format!("job {new_name} already exists")));
        }

        let mut clone = self
            .jobs
            .get(job.0)
            .ok_or_else(|| TerraError::Backend(format!("unknown {job}")))?
            .clone();
        clone.name = new_name.to_string();

        let id = JobId(self.jobs.insert(clone));
        self.job_names.insert(new_name.to_string(), id);
        Ok(id)
    }

    fn property(&self, job: JobId, key: &str) -> Option<i32> {
        self.jobs[job.0].properties.get(key).copied()
    }

    fn set_property(&mut self, job: JobId, key: &str, value: i32) {
        self.jobs[job.0].properties.insert(key.to_string(), value);
    }

    fn threads_per_group(&self, job: JobId) -> [u32; 3] {
        self.jobs[job.0].threads_per_group
    }

    fn find_parameter(&self, job: JobId, name: &str) -> Option<ParamId> {
        self.jobs[job.0]
            .params
            .iter()
            .find(|(_, (param, _))| param == name)
            .map(|(key, _)| ParamId(key))
    }

    fn set_manual_value(&mut self, job: JobId, param: ParamId, value: ParamValue) {
        let job = &mut self.jobs[job.0];
        if let Some((_, stored)) = job.params.get_mut(param.0) {
            *stored = value;
            job.dirty = true;
        }
    }

    fn add_parameter(&mut self, job: JobId, name: &str, value: ParamValue) -> ParamId {
        let job = &mut self.jobs[job.0];
        job.dirty = true;
        ParamId(job.params.insert((name.to_string(), value)))
    }

    fn remove_parameters_with_prefix(&mut self, job: JobId, prefix: &str) {
        self.jobs[job.0]
            .params
            .retain(|_, (name, _)| !name.starts_with(prefix));
    }

    fn set_const_buffer(&mut self, job: JobId, slot: u8, buffer: BufferId) {
        self.jobs[job.0].const_buffers.insert(slot, buffer);
    }

    fn set_texture(&mut self, job: JobId, slot: u8, texture: TextureId) {
        self.jobs[job.0].textures.insert(slot, texture);
    }

    fn set_num_thread_groups(&mut self, job: JobId, groups: [u32; 3]) {
        self.jobs[job.0].thread_groups = groups;
    }

    fn set_params_dirty(&mut self, job: JobId) {
        self.jobs[job.0].dirty = true;
    }
}

impl Compositor for HeadlessBackend {
    fn add_workspace(&mut self, definition: &str, channels: &[TextureId]) -> TerraResult<WorkspaceId> {
        if let Some(missing) = channels.iter().find(|id| !self.textures.contains(id.0)) {
            return Err(TerraError::Backend(format!(
                "workspace {definition} bound to destroyed {missing}"
            )));
        }

        Ok(WorkspaceId(self.workspaces.insert(HeadlessWorkspace {
            definition: definition.to_string(),
            channels: channels.to_vec(),
            updates: 0,
        })))
    }

    fn update_workspace(&mut self, workspace: WorkspaceId) {
        if let Some(workspace) = self.workspaces.get_mut(workspace.0) {
            workspace.updates += 1;
            self.workspace_updates.push(workspace.definition.clone());
        }
    }

    fn remove_workspace(&mut self, workspace: WorkspaceId) {
        self.workspaces.try_remove(workspace.0);
    }
}
