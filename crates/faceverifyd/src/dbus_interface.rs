use crate::engine::{EngineError, EngineHandle};
use zbus::interface;

pub const BUS_NAME: &str = "io.faceverify.Verifier1";
pub const OBJECT_PATH: &str = "/io/faceverify/Verifier1";

/// D-Bus interface for the faceverify daemon.
///
/// Bus name: io.faceverify.Verifier1
/// Object path: /io/faceverify/Verifier1
pub struct VerifierService {
    engine: EngineHandle,
}

impl VerifierService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

#[interface(name = "io.faceverify.Verifier1")]
impl VerifierService {
    /// Submit a matric number: fetch its reference images and start matching.
    async fn submit(&self, matric_number: &str) -> zbus::fdo::Result<()> {
        tracing::info!(matric_number, "submit requested");
        if matric_number.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("matric number is empty".into()));
        }
        self.engine.submit(matric_number).await.map_err(to_fdo)
    }

    /// Update the matric number without starting capture.
    async fn set_identifier(&self, matric_number: &str) -> zbus::fdo::Result<()> {
        tracing::debug!(matric_number, "identifier changed");
        self.engine.set_identifier(matric_number).await.map_err(to_fdo)
    }

    /// End the session and discard its reference images.
    async fn clear(&self) -> zbus::fdo::Result<()> {
        tracing::info!("clear requested");
        self.engine.clear().await.map_err(to_fdo)
    }

    /// Latest verdict: `pending`, `unavailable`, `matched` or `not_matched`.
    async fn verdict(&self) -> zbus::fdo::Result<String> {
        let verdict = self.engine.verdict().await.map_err(to_fdo)?;
        Ok(verdict.to_string())
    }

    /// Return session status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let report = self.engine.status().await.map_err(to_fdo)?;
        serde_json::to_string(&report).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    tracing::error!(error = %err, "engine request failed");
    zbus::fdo::Error::Failed(err.to_string())
}
