// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sandboxed script runner boundary.
//!
//! Notebook/workflow script nodes run in an external sandbox service; the
//! core only consumes it as an RPC taking a script body and a parameter map
//! and returning stdout, an error string, and a return value.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SchedError;

/// Result of one sandbox execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptOutcome {
    #[serde(default)]
    pub stdout: String,
    /// Non-empty when the script itself failed.
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub return_value: Value,
}

/// External script runner.
pub trait Sandbox: Send + Sync {
    /// Run `script` with `inputs`; transport failures surface as
    /// script-execution-failed.
    fn exec_code(
        &self,
        script: String,
        inputs: Value,
    ) -> BoxFuture<'static, Result<ScriptOutcome, SchedError>>;
}

/// HTTP sandbox client.
pub struct HttpSandbox {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct ExecRequest {
    script: String,
    inputs: Value,
}

impl HttpSandbox {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            url: url.into(),
        }
    }
}

impl Sandbox for HttpSandbox {
    fn exec_code(
        &self,
        script: String,
        inputs: Value,
    ) -> BoxFuture<'static, Result<ScriptOutcome, SchedError>> {
        let client = self.client.clone();
        let url = self.url.clone();
        async move {
            let resp = client
                .post(&url)
                .json(&ExecRequest { script, inputs })
                .send()
                .await
                .map_err(|e| SchedError::ScriptExecutionFailed(format!("sandbox send: {e}")))?;
            if !resp.status().is_success() {
                return Err(SchedError::ScriptExecutionFailed(format!(
                    "sandbox status {}",
                    resp.status()
                )));
            }
            resp.json::<ScriptOutcome>()
                .await
                .map_err(|e| SchedError::ScriptExecutionFailed(format!("sandbox decode: {e}")))
        }
        .boxed()
    }
}

/// Function-backed sandbox for tests and local development.
pub struct ScriptedSandbox {
    f: Arc<dyn Fn(&str, &Value) -> Result<ScriptOutcome, SchedError> + Send + Sync>,
}

impl ScriptedSandbox {
    pub fn new(
        f: impl Fn(&str, &Value) -> Result<ScriptOutcome, SchedError> + Send + Sync + 'static,
    ) -> Self {
        Self { f: Arc::new(f) }
    }
}

impl Sandbox for ScriptedSandbox {
    fn exec_code(
        &self,
        script: String,
        inputs: Value,
    ) -> BoxFuture<'static, Result<ScriptOutcome, SchedError>> {
        let f = Arc::clone(&self.f);
        async move { f(&script, &inputs) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_sandbox_passes_inputs_through() -> anyhow::Result<()> {
        let sandbox = ScriptedSandbox::new(|script, inputs| {
            assert_eq!(script, "return inputs");
            Ok(ScriptOutcome {
                stdout: String::new(),
                error: String::new(),
                return_value: inputs.clone(),
            })
        });
        let outcome = sandbox
            .exec_code("return inputs".to_owned(), serde_json::json!({"x": 1}))
            .await?;
        assert_eq!(outcome.return_value, serde_json::json!({"x": 1}));
        Ok(())
    }
}
