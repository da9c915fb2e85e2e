//! Sandbox Control-Plane Client
//!
//! Communicates with the platform's control plane for command execution,
//! file I/O, port exposure, credits, and sandbox lifecycle.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::types::{ExecResult, HundredthCents, PortInfo, SandboxProvider};

/// HTTP client for the sandbox control plane.
pub struct HttpSandboxProvider {
    pub api_url: String,
    pub api_key: String,
    pub sandbox_id: String,
    http: Client,
}

impl HttpSandboxProvider {
    pub fn new(api_url: String, api_key: String, sandbox_id: String) -> Self {
        Self {
            api_url,
            api_key,
            sandbox_id,
            http: Client::new(),
        }
    }

    /// Internal helper: send an HTTP request and return JSON.
    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{}", self.api_url, path);

        let mut builder = match method {
            "POST" => self.http.post(&url),
            "PUT" => self.http.put(&url),
            "DELETE" => self.http.delete(&url),
            _ => self.http.get(&url),
        };

        builder = builder
            .header("Content-Type", "application/json")
            .header("Authorization", &self.api_key);

        if let Some(b) = body {
            builder = builder.json(&b);
        }

        let resp = builder
            .send()
            .await
            .with_context(|| format!("control plane request failed: {method} {path}"))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "control plane error: {method} {path} -> {}: {text}",
                status.as_u16()
            );
        }

        let json: Value = resp
            .json()
            .await
            .context("failed to parse control plane response")?;
        Ok(json)
    }
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    async fn exec(&self, command: &str, timeout_ms: Option<u64>) -> Result<ExecResult> {
        let mut body = serde_json::json!({ "command": command });
        if let Some(t) = timeout_ms {
            body["timeout"] = serde_json::json!(t);
        }

        let result = self
            .request(
                "POST",
                &format!("/v1/sandboxes/{}/exec", self.sandbox_id),
                Some(body),
            )
            .await?;

        Ok(ExecResult {
            stdout: result["stdout"].as_str().unwrap_or("").to_string(),
            stderr: result["stderr"].as_str().unwrap_or("").to_string(),
            exit_code: result["exit_code"]
                .as_i64()
                .or_else(|| result["exitCode"].as_i64())
                .unwrap_or(0) as i32,
        })
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let body = serde_json::json!({ "path": path, "content": content });
        self.request(
            "POST",
            &format!("/v1/sandboxes/{}/files/upload/json", self.sandbox_id),
            Some(body),
        )
        .await?;
        Ok(())
    }

    async fn read_file(&self, file_path: &str) -> Result<String> {
        let encoded = urlencoding::encode(file_path);
        let result = self
            .request(
                "GET",
                &format!(
                    "/v1/sandboxes/{}/files/read?path={}",
                    self.sandbox_id, encoded
                ),
                None,
            )
            .await?;

        Ok(result["content"]
            .as_str()
            .or_else(|| result.as_str())
            .unwrap_or("")
            .to_string())
    }

    async fn expose_port(&self, port: u16) -> Result<PortInfo> {
        let body = serde_json::json!({ "port": port });
        let result = self
            .request(
                "POST",
                &format!("/v1/sandboxes/{}/ports", self.sandbox_id),
                Some(body),
            )
            .await?;

        Ok(PortInfo {
            port,
            public_url: result["public_url"]
                .as_str()
                .or_else(|| result["publicUrl"].as_str())
                .unwrap_or("")
                .to_string(),
        })
    }

    async fn credits_balance(&self) -> Result<HundredthCents> {
        let result = self.request("GET", "/v1/credits/balance", None).await?;

        // The control plane reports cents; the ledger runs in
        // hundredth-cents.
        let cents = result["balance_cents"]
            .as_f64()
            .or_else(|| result["balanceCents"].as_f64())
            .unwrap_or(0.0);
        Ok((cents * 100.0).floor() as HundredthCents)
    }

    async fn transfer_credits(
        &self,
        to_address: &str,
        amount_hundredth_cents: HundredthCents,
    ) -> Result<()> {
        let body = serde_json::json!({
            "to": to_address,
            "amount_cents": amount_hundredth_cents as f64 / 100.0,
        });
        self.request("POST", "/v1/credits/transfer", Some(body))
            .await?;
        Ok(())
    }

    async fn create_sandbox(&self, name: &str) -> Result<String> {
        let body = serde_json::json!({ "name": name, "vcpu": 1, "memory_mb": 512 });
        let result = self.request("POST", "/v1/sandboxes", Some(body)).await?;
        result["id"]
            .as_str()
            .map(|s| s.to_string())
            .context("sandbox create response missing id")
    }

    async fn sandbox_status(&self, sandbox_id: &str) -> Result<String> {
        let result = self
            .request("GET", &format!("/v1/sandboxes/{sandbox_id}"), None)
            .await?;
        Ok(result["status"].as_str().unwrap_or("unknown").to_string())
    }
}
