//! Pyroscope agent backed by the pprof-rs CPU sampler.

use std::sync::Mutex;

use pyroscope::pyroscope::PyroscopeAgentRunning;
use pyroscope::PyroscopeAgent;
use pyroscope_pprofrs::{pprof_backend, PprofConfig};

use super::{ProfileError, Profiler, PyroscopeDsn};

/// A running Pyroscope agent.
pub struct PyroscopeProfiler {
    agent: Mutex<Option<PyroscopeAgent<PyroscopeAgentRunning>>>,
}

impl From<pyroscope::PyroscopeError> for ProfileError {
    fn from(e: pyroscope::PyroscopeError) -> Self {
        ProfileError::Agent(e.to_string())
    }
}

/// Build and start an agent reporting as `service`.
pub fn start(
    dsn: &PyroscopeDsn,
    service: &str,
    sample_rate: u32,
    tags: &[(String, String)],
) -> Result<PyroscopeProfiler, ProfileError> {
    let tags: Vec<(&str, &str)> = tags.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

    let mut builder = PyroscopeAgent::builder(dsn.server.as_str(), service)
        .backend(pprof_backend(PprofConfig::new().sample_rate(sample_rate)))
        .tags(tags);
    if let Some((user, password)) = &dsn.basic_auth {
        builder = builder.basic_auth(user, password);
    }
    if let Some(token) = &dsn.token {
        builder = builder.auth_token(token);
    }
    if let Some(tenant) = &dsn.tenant_id {
        builder = builder.tenant_id(tenant.clone());
    }

    let agent = builder.build()?.start()?;
    Ok(PyroscopeProfiler {
        agent: Mutex::new(Some(agent)),
    })
}

impl Profiler for PyroscopeProfiler {
    fn stop(&self) -> Result<(), ProfileError> {
        let agent = match self.agent.lock() {
            Ok(mut agent) => agent.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(agent) = agent {
            agent.stop()?.shutdown();
        }
        Ok(())
    }
}
