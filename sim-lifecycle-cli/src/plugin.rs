//! Post-processing plugins loaded as shared libraries
//!
//! A plugin directory holds a `plugin.toml` manifest naming the library. The
//! library exports two C functions:
//!
//! ```text
//! char *sim_post_process_end(const char *request_json);
//! void  sim_post_process_free(char *response_json);
//! ```
//!
//! The request is a JSON-encoded [`PostProcessRequest`]. The response is either
//! a [`SubmissionSpec`] or `{"error": "..."}`.

use serde::{Deserialize, Serialize};
use sim_lifecycle::{LifecycleError, PostProcessRequest, PostProcessor, SubmissionSpec};
use std::ffi::{c_char, CStr, CString};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Manifest file inside a plugin directory
pub const MANIFEST_FILE: &str = "plugin.toml";

const END_SYMBOL: &[u8] = b"sim_post_process_end\0";
const FREE_SYMBOL: &[u8] = b"sim_post_process_free\0";

type EndFn = unsafe extern "C" fn(*const c_char) -> *mut c_char;
type FreeFn = unsafe extern "C" fn(*mut c_char);

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Failed to access plugin manifest {path:?}: {source}")]
    Manifest { path: PathBuf, source: std::io::Error },

    #[error("Invalid plugin manifest {path:?}: {message}")]
    InvalidManifest { path: PathBuf, message: String },

    #[error("Failed to load plugin library: {0}")]
    Load(#[from] libloading::Error),

    #[error("Plugin returned no response")]
    NullResponse,

    #[error("Plugin reported an error: {0}")]
    Reported(String),

    #[error("Invalid plugin payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Request contains an interior NUL byte")]
    Nul(#[from] std::ffi::NulError),
}

impl From<PluginError> for LifecycleError {
    fn from(e: PluginError) -> Self {
        LifecycleError::PostProcessor(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Library file, relative to the plugin directory
    pub library: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl Default for PluginManifest {
    fn default() -> Self {
        Self {
            library: format!(
                "{}post_processor{}",
                std::env::consts::DLL_PREFIX,
                std::env::consts::DLL_SUFFIX
            ),
            name: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PluginResponse {
    Spec(SubmissionSpec),
    Failure { error: String },
}

/// Read the manifest, creating the directory and a default one if absent
pub fn ensure_manifest(dir: &Path) -> Result<PluginManifest, PluginError> {
    let path = dir.join(MANIFEST_FILE);
    let io = |source| PluginError::Manifest { path: path.clone(), source };

    if !path.exists() {
        fs::create_dir_all(dir).map_err(io)?;
        let manifest = PluginManifest::default();
        let content = toml::to_string(&manifest).map_err(|e| PluginError::InvalidManifest {
            path: path.clone(),
            message: e.to_string(),
        })?;
        fs::write(&path, content).map_err(io)?;
        log::warn!("Created default plugin manifest {:?}", path);
        return Ok(manifest);
    }

    let content = fs::read_to_string(&path).map_err(io)?;
    toml::from_str(&content).map_err(|e| PluginError::InvalidManifest {
        path: path.clone(),
        message: e.to_string(),
    })
}

/// Decode a plugin response
pub fn parse_response(raw: &str) -> Result<SubmissionSpec, PluginError> {
    match serde_json::from_str::<PluginResponse>(raw)? {
        PluginResponse::Spec(spec) => Ok(spec),
        PluginResponse::Failure { error } => Err(PluginError::Reported(error)),
    }
}

/// [`PostProcessor`] calling into a shared library
pub struct DylibPostProcessor {
    library: PathBuf,
}

impl DylibPostProcessor {
    /// Locate the library through the directory's manifest
    pub fn from_dir(dir: &Path) -> Result<Self, PluginError> {
        let manifest = ensure_manifest(dir)?;
        if let Some(name) = &manifest.name {
            log::debug!("Using post processor '{}'", name);
        }
        Ok(Self {
            library: dir.join(manifest.library),
        })
    }

    pub fn library(&self) -> &Path {
        &self.library
    }

    fn call(&self, request: &PostProcessRequest) -> Result<SubmissionSpec, PluginError> {
        let input = CString::new(serde_json::to_string(request)?)?;
        log::debug!("Calling post processor {:?}", self.library);

        // SAFETY: the library is trusted user code implementing the documented
        // interface; the returned string is released by the same library.
        let raw = unsafe {
            let library = libloading::Library::new(&self.library)?;
            let end: libloading::Symbol<EndFn> = library.get(END_SYMBOL)?;
            let free: libloading::Symbol<FreeFn> = library.get(FREE_SYMBOL)?;

            let output = end(input.as_ptr());
            if output.is_null() {
                return Err(PluginError::NullResponse);
            }
            let raw = CStr::from_ptr(output).to_string_lossy().into_owned();
            free(output);
            raw
        };

        parse_response(&raw)
    }
}

impl PostProcessor for DylibPostProcessor {
    fn end(&self, request: &PostProcessRequest) -> sim_lifecycle::Result<SubmissionSpec> {
        Ok(self.call(request)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_lifecycle::{LifecycleDocument, RestartMode};
    use tempfile::TempDir;

    #[test]
    fn test_manifest_created_once() {
        let dir = TempDir::new().unwrap();
        let plugin_dir = dir.path().join("post_processor");

        let created = ensure_manifest(&plugin_dir).unwrap();
        assert_eq!(created, PluginManifest::default());
        assert!(plugin_dir.join(MANIFEST_FILE).exists());

        fs::write(plugin_dir.join(MANIFEST_FILE), "library = \"libmsd.so\"\nname = \"msd\"\n").unwrap();
        let processor = DylibPostProcessor::from_dir(&plugin_dir).unwrap();
        assert_eq!(processor.library(), plugin_dir.join("libmsd.so"));
    }

    #[test]
    fn test_invalid_manifest() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), "name = 3").unwrap();
        assert!(matches!(
            ensure_manifest(dir.path()),
            Err(PluginError::InvalidManifest { .. })
        ));
    }

    #[test]
    fn test_parse_response() {
        let spec = parse_response(r#"{"executable": "python3", "arguments": "msd.py", "poll_executable": "echo"}"#).unwrap();
        assert_eq!(spec.executable, "python3");
        assert_eq!(spec.poll_command().as_deref(), Some("echo"));

        let err = parse_response(r#"{"error": "no dumps"}"#).unwrap_err();
        assert!(matches!(err, PluginError::Reported(ref m) if m == "no dumps"));
    }

    #[test]
    fn test_missing_library_is_post_processor_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), "library = \"libmissing.so\"\n").unwrap();
        let processor = DylibPostProcessor::from_dir(dir.path()).unwrap();
        let request = PostProcessRequest {
            cwd: dir.path().to_path_buf(),
            state: LifecycleDocument::new(1700000000, RestartMode::None, Default::default()),
            args: Vec::new(),
            worker_count: 1,
        };
        let err = processor.end(&request).unwrap_err();
        assert_eq!(err.kind(), "PostProcessorError");
    }
}
