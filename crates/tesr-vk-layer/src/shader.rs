//! Locating, compiling and caching the compute shader.
//!
//! The GLSL source sits next to a SPIR-V cache file. The cache file is
//! rebuilt with `naga` whenever the source is newer, and the loaded binary is
//! kept in memory keyed on the source modification time.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use anyhow::{anyhow, bail, Context};
use once_cell::sync::{Lazy, OnceCell};
use tracing::{debug, info, warn};

use crate::config::LayerEnv;

pub const SHADER_SOURCE: &str = "placeholder_ao.comp";
pub const SHADER_BINARY: &str = "placeholder_ao.spv";

/// Identifies one shader binary; the device pipeline is rebuilt when it
/// changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderStamp {
    pub timestamp: Option<SystemTime>,
    pub code_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBinary {
    pub code: Vec<u32>,
    pub timestamp: Option<SystemTime>,
}

impl ShaderBinary {
    pub fn stamp(&self) -> ShaderStamp {
        ShaderStamp {
            timestamp: self.timestamp,
            code_len: self.code.len(),
        }
    }
}

/// Directories searched for the shader files, most specific first.
pub fn candidate_dirs(module_dir: &Path, cwd: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = vec![
        module_dir.join("Shaders"),
        module_dir.join("VulkanLayer").join("Shaders"),
        module_dir.join("..").join("VulkanLayer").join("Shaders"),
    ];
    if let Some(cwd) = cwd {
        dirs.push(cwd.join("VulkanLayer").join("Shaders"));
    }
    dirs
}

/// The override if set, else the first existing candidate, else the module
/// directory itself.
pub fn select_shader_dir(env: &LayerEnv, module_dir: &Path, cwd: Option<&Path>) -> PathBuf {
    if let Some(dir) = &env.shader_dir {
        return dir.clone();
    }
    candidate_dirs(module_dir, cwd)
        .into_iter()
        .find(|dir| dir.exists())
        .map(|dir| fs::canonicalize(&dir).unwrap_or(dir))
        .unwrap_or_else(|| module_dir.to_path_buf())
}

/// Directory holding the shader files, resolved once per process.
pub fn shader_dir() -> &'static Path {
    static DIR: OnceCell<PathBuf> = OnceCell::new();
    DIR.get_or_init(|| {
        let cwd = std::env::current_dir().ok();
        let module_dir = module_dir()
            .or_else(|| cwd.clone())
            .unwrap_or_default();
        let dir = select_shader_dir(&LayerEnv::from_env(), &module_dir, cwd.as_deref());
        info!(dir = %dir.display(), "Using compute shader directory");
        dir
    })
}

#[cfg(unix)]
fn module_dir() -> Option<PathBuf> {
    use std::ffi::{c_void, CStr, OsStr};
    use std::os::unix::ffi::OsStrExt;

    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let anchor = module_dir as fn() -> Option<PathBuf> as *const c_void;
    if unsafe { libc::dladdr(anchor, &mut info) } == 0 || info.dli_fname.is_null() {
        return None;
    }
    let path = unsafe { CStr::from_ptr(info.dli_fname) };
    Path::new(OsStr::from_bytes(path.to_bytes()))
        .parent()
        .map(Path::to_path_buf)
}

#[cfg(windows)]
fn module_dir() -> Option<PathBuf> {
    use std::ffi::OsString;
    use std::os::windows::ffi::OsStringExt;

    use windows::core::PCWSTR;
    use windows::Win32::Foundation::HMODULE;
    use windows::Win32::System::LibraryLoader::{
        GetModuleFileNameW, GetModuleHandleExW, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
        GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
    };

    let anchor = module_dir as fn() -> Option<PathBuf> as *const u16;
    let mut module = HMODULE::default();
    unsafe {
        GetModuleHandleExW(
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
            PCWSTR(anchor),
            &mut module,
        )
    }
    .ok()?;
    let mut buf = vec![0u16; 1024];
    let len = unsafe { GetModuleFileNameW(Some(module), &mut buf) } as usize;
    if len == 0 || len >= buf.len() {
        return None;
    }
    PathBuf::from(OsString::from_wide(&buf[..len]))
        .parent()
        .map(Path::to_path_buf)
}

#[cfg(not(any(unix, windows)))]
fn module_dir() -> Option<PathBuf> {
    None
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Read SPIR-V words, zero-padding a trailing partial word.
fn read_spirv(path: &Path) -> anyhow::Result<Vec<u32>> {
    let mut bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if bytes.is_empty() {
        bail!("{} is empty", path.display());
    }
    bytes.resize(bytes.len().next_multiple_of(4), 0);
    Ok(bytes
        .chunks_exact(4)
        .map(|word| u32::from_ne_bytes([word[0], word[1], word[2], word[3]]))
        .collect())
}

fn write_spirv(path: &Path, code: &[u32]) -> anyhow::Result<()> {
    let bytes: Vec<u8> = code.iter().flat_map(|word| word.to_ne_bytes()).collect();
    fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

/// Compile GLSL compute source to SPIR-V with entry point `main`.
pub fn compile_compute_glsl(source: &str) -> anyhow::Result<Vec<u32>> {
    let mut frontend = naga::front::glsl::Frontend::default();
    let module = frontend
        .parse(&naga::front::glsl::Options::from(naga::ShaderStage::Compute), source)
        .map_err(|e| anyhow!("GLSL parse failed: {e:?}"))?;
    let info = naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::all())
        .validate(&module)
        .map_err(|e| anyhow!("shader validation failed: {e:?}"))?;
    naga::back::spv::write_vec(
        &module,
        &info,
        &naga::back::spv::Options::default(),
        Some(&naga::back::spv::PipelineOptions {
            shader_stage: naga::ShaderStage::Compute,
            entry_point: "main".into(),
        }),
    )
    .context("SPIR-V generation failed")
}

/// In-memory copy of the last loaded binary.
#[derive(Debug, Default)]
pub struct ShaderCache {
    timestamp: Option<SystemTime>,
    code: Vec<u32>,
}

impl ShaderCache {
    pub const fn new() -> Self {
        Self {
            timestamp: None,
            code: Vec::new(),
        }
    }

    /// Return the shader in `dir`, recompiling or rereading only when the
    /// source changed since the cached copy.
    pub fn load(&mut self, dir: &Path) -> anyhow::Result<ShaderBinary> {
        let source_path = dir.join(SHADER_SOURCE);
        let binary_path = dir.join(SHADER_BINARY);
        let source_time = modified(&source_path);

        if !self.code.is_empty() && source_time == self.timestamp {
            return Ok(self.binary());
        }

        let mut code = Vec::new();
        if let Some(binary_time) = modified(&binary_path) {
            let fresh = match source_time {
                None => true,
                Some(source_time) => binary_time >= source_time,
            };
            if fresh {
                match read_spirv(&binary_path) {
                    Ok(words) => code = words,
                    Err(err) => warn!(error = %err, "Ignoring cached shader binary"),
                }
            }
        }

        if code.is_empty() && source_time.is_some() {
            let source = fs::read_to_string(&source_path)
                .with_context(|| format!("reading {}", source_path.display()))?;
            code = compile_compute_glsl(&source).with_context(|| format!("compiling {}", source_path.display()))?;
            if let Err(err) = write_spirv(&binary_path, &code) {
                warn!(error = %err, "Could not write shader cache");
            }
            info!(path = %source_path.display(), words = code.len(), "Compiled compute shader");
        }

        if code.is_empty() {
            bail!("unable to load compute shader from {}", dir.display());
        }

        debug!(words = code.len(), "Loaded compute shader");
        self.code = code;
        self.timestamp = source_time;
        Ok(self.binary())
    }

    fn binary(&self) -> ShaderBinary {
        ShaderBinary {
            code: self.code.clone(),
            timestamp: self.timestamp,
        }
    }
}

static CACHE: Lazy<Mutex<ShaderCache>> = Lazy::new(|| Mutex::new(ShaderCache::new()));

/// Load the compute shader through the process-wide cache.
pub fn load_compute_shader() -> anyhow::Result<ShaderBinary> {
    CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .load(shader_dir())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pipeline::{DEPTH_BINDING, DEPTH_SAMPLER_BINDING, OUTPUT_BINDING};

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    const STORE_SHADER: &str = r#"#version 450
layout(local_size_x = 8, local_size_y = 8) in;
layout(set = 0, binding = 0, rgba16f) writeonly uniform image2D outputImage;

void main() {
    imageStore(outputImage, ivec2(gl_GlobalInvocationID.xy), vec4(1.0));
}
"#;

    fn set_mtime(path: &Path, time: SystemTime) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_ne_bytes()).collect()
    }

    #[test]
    fn candidates_are_searched_in_order() {
        let root = tempfile::tempdir().unwrap();
        let module_dir = root.path().join("bin");
        fs::create_dir_all(module_dir.join("VulkanLayer").join("Shaders")).unwrap();
        fs::create_dir_all(root.path().join("VulkanLayer").join("Shaders")).unwrap();

        let dir = select_shader_dir(&LayerEnv::default(), &module_dir, None);
        assert_eq!(
            dir,
            fs::canonicalize(module_dir.join("VulkanLayer").join("Shaders")).unwrap()
        );

        fs::create_dir_all(module_dir.join("Shaders")).unwrap();
        let dir = select_shader_dir(&LayerEnv::default(), &module_dir, None);
        assert_eq!(dir, fs::canonicalize(module_dir.join("Shaders")).unwrap());
    }

    #[test]
    fn parent_and_cwd_candidates_are_considered() {
        let root = tempfile::tempdir().unwrap();
        let module_dir = root.path().join("bin");
        fs::create_dir_all(&module_dir).unwrap();
        let cwd = root.path().join("game");
        fs::create_dir_all(cwd.join("VulkanLayer").join("Shaders")).unwrap();

        let dir = select_shader_dir(&LayerEnv::default(), &module_dir, Some(&cwd));
        assert_eq!(dir, fs::canonicalize(cwd.join("VulkanLayer").join("Shaders")).unwrap());

        fs::create_dir_all(root.path().join("VulkanLayer").join("Shaders")).unwrap();
        let dir = select_shader_dir(&LayerEnv::default(), &module_dir, Some(&cwd));
        assert_eq!(
            dir,
            fs::canonicalize(root.path().join("VulkanLayer").join("Shaders")).unwrap()
        );
    }

    #[test]
    fn no_candidate_falls_back_to_module_dir() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(select_shader_dir(&LayerEnv::default(), root.path(), None), root.path());
    }

    #[test]
    fn override_skips_search() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("Shaders")).unwrap();
        let env = LayerEnv {
            shader_dir: Some(PathBuf::from("/elsewhere")),
        };
        assert_eq!(select_shader_dir(&env, root.path(), None), Path::new("/elsewhere"));
    }

    #[test]
    fn compiles_glsl_to_spirv() {
        let code = compile_compute_glsl(STORE_SHADER).unwrap();
        assert_eq!(code[0], SPIRV_MAGIC);
    }

    #[test]
    fn shipped_shader_samples_depth_through_separate_bindings() {
        let source = include_str!("../shaders/placeholder_ao.comp");
        assert_eq!(compile_compute_glsl(source).unwrap()[0], SPIRV_MAGIC);

        let module = naga::front::glsl::Frontend::default()
            .parse(&naga::front::glsl::Options::from(naga::ShaderStage::Compute), source)
            .unwrap();
        let mut bindings: Vec<u32> = module
            .global_variables
            .iter()
            .filter_map(|(_, var)| var.binding.as_ref().map(|b| b.binding))
            .collect();
        bindings.sort_unstable();
        assert_eq!(bindings, [OUTPUT_BINDING, DEPTH_BINDING, DEPTH_SAMPLER_BINDING]);
    }

    #[test]
    fn invalid_glsl_is_an_error() {
        assert!(compile_compute_glsl("#version 450\nvoid main() { undefined_call(); }\n").is_err());
    }

    #[test]
    fn source_is_compiled_and_cached_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SHADER_SOURCE), STORE_SHADER).unwrap();

        let mut cache = ShaderCache::new();
        let binary = cache.load(dir.path()).unwrap();
        assert_eq!(binary.code[0], SPIRV_MAGIC);
        assert!(binary.timestamp.is_some());

        let on_disk = read_spirv(&dir.path().join(SHADER_BINARY)).unwrap();
        assert_eq!(on_disk, binary.code);
    }

    #[test]
    fn fresh_binary_is_read_and_padded() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join(SHADER_SOURCE);
        let binary = dir.path().join(SHADER_BINARY);
        fs::write(&source, "not valid glsl").unwrap();
        let mut bytes = words_to_bytes(&[SPIRV_MAGIC, 7]);
        bytes.push(0xAA);
        fs::write(&binary, &bytes).unwrap();

        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        set_mtime(&source, base);
        set_mtime(&binary, base + Duration::from_secs(10));

        let loaded = ShaderCache::new().load(dir.path()).unwrap();
        assert_eq!(loaded.code.len(), 3);
        assert_eq!(loaded.code[..2], [SPIRV_MAGIC, 7]);
        assert_eq!(loaded.code[2], u32::from_ne_bytes([0xAA, 0, 0, 0]));
    }

    #[test]
    fn stale_binary_is_recompiled() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join(SHADER_SOURCE);
        let binary = dir.path().join(SHADER_BINARY);
        fs::write(&source, STORE_SHADER).unwrap();
        fs::write(&binary, words_to_bytes(&[SPIRV_MAGIC, 1])).unwrap();

        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        set_mtime(&binary, base);
        set_mtime(&source, base + Duration::from_secs(10));

        let loaded = ShaderCache::new().load(dir.path()).unwrap();
        assert!(loaded.code.len() > 2);
        assert_eq!(read_spirv(&binary).unwrap(), loaded.code);
    }

    #[test]
    fn binary_without_source_is_used() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SHADER_BINARY), words_to_bytes(&[SPIRV_MAGIC, 3])).unwrap();

        let loaded = ShaderCache::new().load(dir.path()).unwrap();
        assert_eq!(loaded.code, vec![SPIRV_MAGIC, 3]);
        assert_eq!(loaded.timestamp, None);
    }

    #[test]
    fn unchanged_source_is_served_from_memory() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join(SHADER_SOURCE);
        let binary = dir.path().join(SHADER_BINARY);
        fs::write(&source, STORE_SHADER).unwrap();

        let mut cache = ShaderCache::new();
        let first = cache.load(dir.path()).unwrap();
        fs::write(&binary, words_to_bytes(&[SPIRV_MAGIC])).unwrap();
        let second = cache.load(dir.path()).unwrap();
        assert_eq!(first, second);

        // A newer source invalidates the cached copy.
        set_mtime(&source, first.timestamp.unwrap() + Duration::from_secs(60));
        let third = cache.load(dir.path()).unwrap();
        assert_ne!(third.stamp(), first.stamp());
    }

    #[test]
    fn missing_files_are_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ShaderCache::new().load(dir.path()).is_err());
    }
}
