//! Shader registry and bytecode sources.
//!
//! Shaders are interned by `(stage, entry point, bytecode)`. Registering the
//! same bytecode twice returns the same [`Shader`], which gives every shader a
//! stable [`ShaderId`] that pipeline cache keys can refer to.

use crate::driver::{DriverRef, ShaderDesc, ShaderHandles, ShaderStageRef};
use crate::error::{GpuError, Result};
use ash::vk;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::path::PathBuf;
use std::sync::Arc;

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Convert a SPIR-V byte blob into words.
pub fn bytes_to_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(GpuError::ShaderCompilation(format!(
            "SPIR-V length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    if words.first() != Some(&SPIRV_MAGIC) {
        return Err(GpuError::ShaderCompilation(
            "missing SPIR-V magic number".to_string(),
        ));
    }
    Ok(words)
}

/// Stable identity of a registered shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderId(u32);

impl ShaderId {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// A compiled shader stage.
#[derive(Debug)]
pub struct Shader {
    id: ShaderId,
    stage: vk::ShaderStageFlags,
    entry: CString,
    handles: ShaderHandles,
}

impl Shader {
    pub fn id(&self) -> ShaderId {
        self.id
    }

    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    pub fn entry(&self) -> &CStr {
        &self.entry
    }

    pub fn module(&self) -> vk::ShaderModule {
        self.handles.module
    }

    /// Null unless shader objects are in use.
    pub fn object(&self) -> vk::ShaderEXT {
        self.handles.object
    }

    pub fn stage_ref(&self) -> ShaderStageRef<'_> {
        ShaderStageRef {
            stage: self.stage,
            module: self.handles.module,
            entry: &self.entry,
        }
    }
}

#[derive(Hash, PartialEq, Eq)]
struct ContentKey {
    stage: vk::ShaderStageFlags,
    entry: CString,
    code: Vec<u32>,
}

#[derive(Default)]
struct RegistryInner {
    shaders: HashMap<ContentKey, Arc<Shader>>,
    next_id: u32,
}

/// Interns shaders and owns their driver objects.
pub struct ShaderRegistry {
    driver: DriverRef,
    set_layout: vk::DescriptorSetLayout,
    push_constant_size: u32,
    create_objects: bool,
    inner: RwLock<RegistryInner>,
}

impl ShaderRegistry {
    /// Shaders are created against the bindless set layout. With
    /// `create_objects`, each also gets a direct-bind shader object.
    pub fn new(
        driver: DriverRef,
        set_layout: vk::DescriptorSetLayout,
        push_constant_size: u32,
        create_objects: bool,
    ) -> Self {
        Self {
            driver,
            set_layout,
            push_constant_size,
            create_objects,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Register SPIR-V for one stage, returning the existing shader when the
    /// same bytecode was registered before.
    pub fn register(
        &self,
        stage: vk::ShaderStageFlags,
        entry: &str,
        code: &[u32],
    ) -> Result<Arc<Shader>> {
        let entry = CString::new(entry)
            .map_err(|_| GpuError::ShaderCompilation(format!("invalid entry point {entry:?}")))?;
        let key = ContentKey {
            stage,
            entry,
            code: code.to_vec(),
        };

        if let Some(shader) = self.inner.read().shaders.get(&key) {
            return Ok(shader.clone());
        }

        let mut inner = self.inner.write();
        if let Some(shader) = inner.shaders.get(&key) {
            return Ok(shader.clone());
        }

        let handles = self.driver.create_shader(&ShaderDesc {
            stage,
            entry: &key.entry,
            code,
            set_layout: self.set_layout,
            push_constant_size: self.push_constant_size,
            create_object: self.create_objects,
        })?;

        let id = ShaderId(inner.next_id);
        inner.next_id += 1;
        let shader = Arc::new(Shader {
            id,
            stage,
            entry: key.entry.clone(),
            handles,
        });
        tracing::debug!("Registered {:?} shader {:?}", stage, id);
        inner.shaders.insert(key, shader.clone());
        Ok(shader)
    }

    /// Load bytecode through `source` and register it.
    pub fn load(
        &self,
        source: &dyn ShaderSource,
        request: &ShaderRequest<'_>,
        stage: vk::ShaderStageFlags,
        entry: &str,
    ) -> Result<Arc<Shader>> {
        let code = source.load(request)?;
        self.register(stage, entry, &code)
    }

    pub fn len(&self) -> usize {
        self.inner.read().shaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every registered shader. Pipelines built from them must be
    /// destroyed first.
    pub(crate) fn destroy(&self) {
        let mut inner = self.inner.write();
        for (_, shader) in inner.shaders.drain() {
            self.driver.destroy_shader(shader.handles);
        }
    }
}

/// Shader stages bound together for a draw.
#[derive(Debug, Clone)]
pub struct ShaderSet {
    pub vertex: Arc<Shader>,
    pub tess_control: Option<Arc<Shader>>,
    pub tess_eval: Option<Arc<Shader>>,
    pub geometry: Option<Arc<Shader>>,
    pub fragment: Option<Arc<Shader>>,
}

impl ShaderSet {
    /// Vertex and fragment stages.
    pub fn new(vertex: Arc<Shader>, fragment: Option<Arc<Shader>>) -> Result<Self> {
        Self {
            vertex,
            tess_control: None,
            tess_eval: None,
            geometry: None,
            fragment,
        }
        .validated()
    }

    /// Add tessellation control and evaluation stages.
    pub fn with_tessellation(mut self, control: Arc<Shader>, eval: Arc<Shader>) -> Result<Self> {
        self.tess_control = Some(control);
        self.tess_eval = Some(eval);
        self.validated()
    }

    pub fn with_geometry(mut self, geometry: Arc<Shader>) -> Result<Self> {
        self.geometry = Some(geometry);
        self.validated()
    }

    fn validated(self) -> Result<Self> {
        let slots = [
            (Some(&self.vertex), vk::ShaderStageFlags::VERTEX),
            (
                self.tess_control.as_ref(),
                vk::ShaderStageFlags::TESSELLATION_CONTROL,
            ),
            (
                self.tess_eval.as_ref(),
                vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            ),
            (self.geometry.as_ref(), vk::ShaderStageFlags::GEOMETRY),
            (self.fragment.as_ref(), vk::ShaderStageFlags::FRAGMENT),
        ];
        for (shader, expected) in slots {
            if let Some(shader) = shader {
                if shader.stage() != expected {
                    return Err(GpuError::InvalidState(format!(
                        "{:?} shader bound to the {expected:?} slot",
                        shader.stage()
                    )));
                }
            }
        }
        Ok(self)
    }

    /// Bound stages in pipeline order.
    pub fn stages(&self) -> impl Iterator<Item = &Arc<Shader>> {
        std::iter::once(&self.vertex)
            .chain(self.tess_control.iter())
            .chain(self.tess_eval.iter())
            .chain(self.geometry.iter())
            .chain(self.fragment.iter())
    }

    /// Stages up to and including geometry.
    pub fn pre_rasterization(&self) -> impl Iterator<Item = &Arc<Shader>> {
        self.stages()
            .filter(|shader| shader.stage() != vk::ShaderStageFlags::FRAGMENT)
    }
}

/// How a shader is requested from a [`ShaderSource`].
#[derive(Debug, Clone, Copy)]
pub enum ShaderRequest<'a> {
    /// Compile source text.
    Source {
        name: &'a str,
        text: &'a str,
        stage: vk::ShaderStageFlags,
    },
    /// Load a precompiled blob by file name.
    Cached { filename: &'a str },
}

/// Supplies SPIR-V bytecode.
pub trait ShaderSource: Send + Sync {
    fn load(&self, request: &ShaderRequest<'_>) -> Result<Vec<u32>>;
}

/// Compiles shader source text into SPIR-V words.
pub type ShaderCompiler =
    dyn Fn(&str, &str, vk::ShaderStageFlags) -> Result<Vec<u32>> + Send + Sync;

/// Precompiled SPIR-V blobs on disk, with an optional compiler for source
/// requests. Loaded blobs are kept in memory.
pub struct SpirvCache {
    dir: PathBuf,
    compiler: Option<Box<ShaderCompiler>>,
    blobs: RwLock<HashMap<String, Arc<[u32]>>>,
}

impl SpirvCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            compiler: None,
            blobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_compiler(
        mut self,
        compiler: impl Fn(&str, &str, vk::ShaderStageFlags) -> Result<Vec<u32>> + Send + Sync + 'static,
    ) -> Self {
        self.compiler = Some(Box::new(compiler));
        self
    }

    /// Seed the in-memory cache, e.g. with blobs embedded in the binary.
    pub fn insert(&self, filename: &str, code: Vec<u32>) {
        self.blobs.write().insert(filename.to_string(), code.into());
    }

    fn cached(&self, key: &str, load: impl FnOnce() -> Result<Vec<u32>>) -> Result<Vec<u32>> {
        if let Some(code) = self.blobs.read().get(key) {
            return Ok(code.to_vec());
        }
        let code: Arc<[u32]> = load()?.into();
        self.blobs
            .write()
            .entry(key.to_string())
            .or_insert_with(|| code.clone());
        Ok(code.to_vec())
    }
}

impl ShaderSource for SpirvCache {
    fn load(&self, request: &ShaderRequest<'_>) -> Result<Vec<u32>> {
        match *request {
            ShaderRequest::Cached { filename } => self.cached(filename, || {
                let path = self.dir.join(filename);
                let bytes = std::fs::read(&path).map_err(|e| {
                    GpuError::ShaderCompilation(format!("failed to read {}: {e}", path.display()))
                })?;
                bytes_to_spirv(&bytes)
            }),
            ShaderRequest::Source { name, text, stage } => {
                let compiler = self.compiler.as_ref().ok_or_else(|| {
                    GpuError::ShaderCompilation(format!("no compiler available for {name}"))
                })?;
                self.cached(name, || compiler(name, text, stage))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capabilities::RuntimeCaps;
    use crate::driver::simulated::{CompletionMode, SimulatedAdapter, SimulatedDriver};

    /// Minimal fake module: the magic number plus a tag word.
    pub(crate) fn spirv(tag: u32) -> Vec<u32> {
        vec![SPIRV_MAGIC, 0x0001_0600, tag]
    }

    fn registry(shader_object: bool) -> (Arc<SimulatedDriver>, ShaderRegistry) {
        let caps = RuntimeCaps {
            shader_object,
            ..Default::default()
        };
        let driver = Arc::new(SimulatedDriver::new(
            SimulatedAdapter::discrete("sim").build(),
            caps,
            CompletionMode::Immediate,
        ));
        let registry = ShaderRegistry::new(
            driver.clone(),
            vk::DescriptorSetLayout::null(),
            128,
            shader_object,
        );
        (driver, registry)
    }

    #[test]
    fn identical_bytecode_is_interned() {
        let (driver, registry) = registry(false);
        let a = registry
            .register(vk::ShaderStageFlags::VERTEX, "main", &spirv(1))
            .unwrap();
        let b = registry
            .register(vk::ShaderStageFlags::VERTEX, "main", &spirv(1))
            .unwrap();
        let c = registry
            .register(vk::ShaderStageFlags::FRAGMENT, "main", &spirv(1))
            .unwrap();

        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(registry.len(), 2);
        assert_eq!(driver.live_objects("shader module"), 2);

        registry.destroy();
        assert_eq!(driver.live_objects("shader module"), 0);
        assert!(driver.violations().is_empty());
    }

    #[test]
    fn shader_objects_follow_the_capability() {
        let (_, with_objects) = registry(true);
        let shader = with_objects
            .register(vk::ShaderStageFlags::COMPUTE, "main", &spirv(2))
            .unwrap();
        assert_ne!(shader.object(), vk::ShaderEXT::null());

        let (_, without) = registry(false);
        let shader = without
            .register(vk::ShaderStageFlags::COMPUTE, "main", &spirv(2))
            .unwrap();
        assert_eq!(shader.object(), vk::ShaderEXT::null());
    }

    #[test]
    fn shader_set_rejects_misplaced_stage() {
        let (_, registry) = registry(false);
        let fragment = registry
            .register(vk::ShaderStageFlags::FRAGMENT, "main", &spirv(3))
            .unwrap();
        assert!(ShaderSet::new(fragment.clone(), None).is_err());

        let vertex = registry
            .register(vk::ShaderStageFlags::VERTEX, "main", &spirv(4))
            .unwrap();
        let set = ShaderSet::new(vertex, Some(fragment)).unwrap();
        assert_eq!(set.stages().count(), 2);
        assert_eq!(set.pre_rasterization().count(), 1);
    }

    #[test]
    fn bytes_to_spirv_checks_magic_and_alignment() {
        let bytes: Vec<u8> = spirv(5).iter().flat_map(|w| w.to_le_bytes()).collect();
        assert_eq!(bytes_to_spirv(&bytes).unwrap(), spirv(5));
        assert!(bytes_to_spirv(&bytes[..5]).is_err());
        assert!(bytes_to_spirv(&[0u8; 8]).is_err());
    }

    #[test]
    fn spirv_cache_compiles_source_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache = SpirvCache::new("shaders").with_compiler(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(spirv(6))
        });
        let request = ShaderRequest::Source {
            name: "tri.vert",
            text: "void main() {}",
            stage: vk::ShaderStageFlags::VERTEX,
        };

        assert_eq!(cache.load(&request).unwrap(), spirv(6));
        assert_eq!(cache.load(&request).unwrap(), spirv(6));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_blob_is_a_shader_error() {
        let cache = SpirvCache::new("/nonexistent-halcyon-shaders");
        assert!(matches!(
            cache.load(&ShaderRequest::Cached {
                filename: "missing.spv"
            }),
            Err(GpuError::ShaderCompilation(_))
        ));
    }
}
