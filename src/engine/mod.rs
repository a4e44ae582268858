//! Engine adapter
//!
//! The proxy engine is an external component reached through blocking calls
//! (start, stop, version, config test) that exchange base64 JSON envelopes. The
//! [`EngineBackend`] trait mirrors those calls; [`EngineAdapter`] encodes the
//! requests and decodes the responses.

pub mod envelope;
pub mod process;

pub use envelope::{CallResponse, StartRequest, INVALID_RESPONSE};
pub use process::{ProcessEngine, ProcessEngineConfig};

use crate::config::document::ConfigDocument;
use crate::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Raw engine calls
///
/// Every call may block for an unbounded time and must be invoked off the
/// async runtime (e.g. through `spawn_blocking`).
pub trait EngineBackend: Send + Sync {
    /// Start the engine from a base64 [`StartRequest`]
    fn run_from_json(&self, request: &str) -> String;

    /// Stop a running engine
    fn stop(&self) -> String;

    /// Engine version
    fn version(&self) -> String;

    /// Check the document of a base64 [`StartRequest`] without running it
    fn test_config(&self, request: &str) -> String;
}

/// Typed wrapper around an [`EngineBackend`]
#[derive(Clone)]
pub struct EngineAdapter {
    backend: Arc<dyn EngineBackend>,
}

impl EngineAdapter {
    pub fn new(backend: Arc<dyn EngineBackend>) -> Self {
        EngineAdapter { backend }
    }

    /// Start the engine with a document
    ///
    /// Fails with [`crate::Error::Engine`] carrying the engine's reason, or
    /// [`INVALID_RESPONSE`] when the response cannot be decoded.
    pub fn start(
        &self,
        data_dir: &Path,
        cache_path: Option<&Path>,
        document: &ConfigDocument,
    ) -> Result<Option<String>> {
        let request = StartRequest {
            dat_dir: data_dir.to_string_lossy().into_owned(),
            mph_cache_path: cache_path.map(|p| p.to_string_lossy().into_owned()),
            config_json: document.to_json()?,
        };

        debug!("Engine start: datDir={}", request.dat_dir);
        let response = self.backend.run_from_json(&request.encode()?);
        let data = CallResponse::decode(&response)?.into_result()?;
        info!("Engine started");
        Ok(data)
    }

    /// Stop the engine
    pub fn stop(&self) -> Result<()> {
        let response = self.backend.stop();
        match CallResponse::decode(&response).and_then(CallResponse::into_result) {
            Ok(_) => {
                info!("Engine stopped");
                Ok(())
            }
            Err(e) => {
                warn!("Engine stop failed: {}", e);
                Err(e)
            }
        }
    }

    /// Ask the engine whether it would accept a document
    ///
    /// Fails like [`EngineAdapter::start`]; nothing is left running.
    pub fn test_config(&self, data_dir: &Path, document: &ConfigDocument) -> Result<()> {
        let request = StartRequest {
            dat_dir: data_dir.to_string_lossy().into_owned(),
            mph_cache_path: None,
            config_json: document.to_json()?,
        };
        let response = self.backend.test_config(&request.encode()?);
        CallResponse::decode(&response)?.into_result()?;
        debug!("Engine accepted document");
        Ok(())
    }

    /// Engine version string
    pub fn version(&self) -> Result<String> {
        let response = self.backend.version();
        Ok(CallResponse::decode(&response)?
            .into_result()?
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingBackend {
        requests: Mutex<Vec<String>>,
        start_response: Mutex<Option<String>>,
    }

    impl EngineBackend for RecordingBackend {
        fn run_from_json(&self, request: &str) -> String {
            self.requests.lock().push(request.to_string());
            self.start_response
                .lock()
                .clone()
                .unwrap_or_else(|| CallResponse::ok(None).encode())
        }

        fn stop(&self) -> String {
            "garbage".to_string()
        }

        fn version(&self) -> String {
            CallResponse::ok(Some("25.3.6".to_string())).encode()
        }

        fn test_config(&self, request: &str) -> String {
            self.requests.lock().push(request.to_string());
            match StartRequest::decode(request) {
                Ok(req) if req.config_json.contains("\"inbounds\":[]") => {
                    CallResponse::fail("no inbound").encode()
                }
                Ok(_) => CallResponse::ok(None).encode(),
                Err(e) => CallResponse::fail(e.to_string()).encode(),
            }
        }
    }

    #[test]
    fn test_start_encodes_request() {
        let backend = Arc::new(RecordingBackend::default());
        let adapter = EngineAdapter::new(backend.clone());
        let document = ConfigDocument::default();

        adapter
            .start(Path::new("/data"), Some(Path::new("/data/mph.cache")), &document)
            .unwrap();

        let requests = backend.requests.lock();
        let request = StartRequest::decode(&requests[0]).unwrap();
        assert_eq!(request.dat_dir, "/data");
        assert_eq!(request.mph_cache_path.as_deref(), Some("/data/mph.cache"));
        assert_eq!(
            ConfigDocument::from_json(&request.config_json).unwrap(),
            document
        );
    }

    #[test]
    fn test_start_failure_reason() {
        let backend = Arc::new(RecordingBackend::default());
        *backend.start_response.lock() = Some(CallResponse::fail("bad config").encode());
        let adapter = EngineAdapter::new(backend);

        match adapter.start(Path::new("/data"), None, &ConfigDocument::default()) {
            Err(Error::Engine(reason)) => assert_eq!(reason, "bad config"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_stop_and_version() {
        let adapter = EngineAdapter::new(Arc::new(RecordingBackend::default()));
        match adapter.stop() {
            Err(Error::Engine(reason)) => assert_eq!(reason, INVALID_RESPONSE),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(adapter.version().unwrap(), "25.3.6");
    }

    #[test]
    fn test_config_check() {
        let backend = Arc::new(RecordingBackend::default());
        let adapter = EngineAdapter::new(backend.clone());
        let document = crate::config::builder::normalize(ConfigDocument::default());

        adapter.test_config(Path::new("/data"), &document).unwrap();
        let request = StartRequest::decode(&backend.requests.lock()[0]).unwrap();
        assert_eq!(request.dat_dir, "/data");
        assert_eq!(request.mph_cache_path, None);

        match adapter.test_config(Path::new("/data"), &ConfigDocument::default()) {
            Err(Error::Engine(reason)) => assert_eq!(reason, "no inbound"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
