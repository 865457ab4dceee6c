//! Upstash Redis REST transport.
//!
//! Commands are sent as a JSON array (`["HMGET", "key", "f1", "f2"]`) in a
//! `POST` to the database URL with a bearer token. Successful replies look
//! like `{"result": ...}`, failures like `{"error": "..."}`. Batches go to
//! `{url}/pipeline` as an array of commands and come back as an array of
//! replies.

use cleanup_map_retry::RetryPolicy;
use serde::Deserialize;
use serde_json::Value;

use crate::{KeyValueStore, TrackerError, require_env};

/// Commands per pipeline request.
const PIPELINE_CHUNK: usize = 100;

/// Connection settings for [`UpstashClient`].
#[derive(Debug, Clone)]
pub struct UpstashConfig {
    /// REST endpoint, e.g. `https://eu1-xxx.upstash.io`.
    pub url: String,
    /// REST bearer token.
    pub token: String,
    /// Retry policy applied to every request.
    pub retry: RetryPolicy,
}

impl UpstashConfig {
    /// Reads `UPSTASH_REDIS_REST_URL` and `UPSTASH_REDIS_REST_TOKEN`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::MissingEnv`] if either is unset.
    pub fn from_env() -> Result<Self, TrackerError> {
        Ok(Self {
            url: require_env("UPSTASH_REDIS_REST_URL")?,
            token: require_env("UPSTASH_REDIS_REST_TOKEN")?,
            retry: RetryPolicy::default(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Client for the Upstash Redis REST API.
pub struct UpstashClient {
    client: reqwest::Client,
    url: String,
    token: String,
    retry: RetryPolicy,
}

impl UpstashClient {
    /// Creates a client from explicit settings.
    #[must_use]
    pub fn new(config: UpstashConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.url.trim_end_matches('/').to_string(),
            token: config.token,
            retry: config.retry,
        }
    }

    /// Creates a client from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::MissingEnv`] if a variable is unset.
    pub fn from_env() -> Result<Self, TrackerError> {
        Ok(Self::new(UpstashConfig::from_env()?))
    }

    /// Sends one command and returns its `result` value.
    async fn command(&self, args: &[&str]) -> Result<Value, TrackerError> {
        let name = command_name(args);
        let body = self
            .retry
            .run(&name, || self.post(&self.url, &name, serde_json::json!(args)))
            .await?;

        let reply: Reply =
            serde_json::from_str(&body).map_err(|e| TrackerError::UnexpectedResponse {
                command: name.clone(),
                message: e.to_string(),
            })?;
        into_result(&name, reply)
    }

    /// Sends a batch of commands through the pipeline endpoint.
    async fn pipeline(&self, commands: &[Vec<String>]) -> Result<Vec<Value>, TrackerError> {
        let name = format!("PIPELINE({})", commands.len());
        let url = format!("{}/pipeline", self.url);
        let body = self
            .retry
            .run(&name, || self.post(&url, &name, serde_json::json!(commands)))
            .await?;

        let replies: Vec<Reply> =
            serde_json::from_str(&body).map_err(|e| TrackerError::UnexpectedResponse {
                command: name.clone(),
                message: e.to_string(),
            })?;
        if replies.len() != commands.len() {
            return Err(TrackerError::UnexpectedResponse {
                command: name,
                message: format!("{} replies for {} commands", replies.len(), commands.len()),
            });
        }

        replies
            .into_iter()
            .zip(commands)
            .map(|(reply, cmd)| into_result(&cmd.join(" "), reply))
            .collect()
    }

    async fn post(&self, url: &str, name: &str, payload: Value) -> Result<String, TrackerError> {
        let http_err = |source| TrackerError::Http {
            command: name.to_string(),
            source,
        };

        let resp = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(http_err)?;

        let status = resp.status();
        let body = resp.text().await.map_err(http_err)?;

        if !status.is_success() {
            // Upstash reports command errors as 400 with an `error` body.
            if let Ok(Reply {
                error: Some(message),
                ..
            }) = serde_json::from_str::<Reply>(&body)
                && status.is_client_error()
                && status.as_u16() != 429
            {
                return Err(TrackerError::Command {
                    command: name.to_string(),
                    message,
                });
            }
            return Err(TrackerError::Status {
                command: name.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(body)
    }
}

fn command_name(args: &[&str]) -> String {
    match args {
        [] => String::new(),
        [cmd] => (*cmd).to_string(),
        [cmd, key, ..] => format!("{cmd} {key}"),
    }
}

fn into_result(command: &str, reply: Reply) -> Result<Value, TrackerError> {
    if let Some(message) = reply.error {
        return Err(TrackerError::Command {
            command: command.to_string(),
            message,
        });
    }
    Ok(reply.result.unwrap_or(Value::Null))
}

fn unexpected(command: &str, value: &Value) -> TrackerError {
    TrackerError::UnexpectedResponse {
        command: command.to_string(),
        message: format!("got {value}"),
    }
}

/// Interprets a reply as an optional string; numbers are stringified.
fn as_opt_string(command: &str, value: &Value) -> Result<Option<String>, TrackerError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(unexpected(command, other)),
    }
}

fn as_opt_string_list(command: &str, value: &Value) -> Result<Vec<Option<String>>, TrackerError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items.iter().map(|v| as_opt_string(command, v)).collect(),
        other => Err(unexpected(command, other)),
    }
}

#[async_trait::async_trait]
impl KeyValueStore for UpstashClient {
    async fn members_of(&self, key: &str) -> Result<Vec<String>, TrackerError> {
        let value = self.command(&["SMEMBERS", key]).await?;
        Ok(as_opt_string_list("SMEMBERS", &value)?
            .into_iter()
            .flatten()
            .collect())
    }

    async fn hash_fields_of(
        &self,
        key: &str,
        fields: &[&str],
    ) -> Result<Vec<Option<String>>, TrackerError> {
        let mut args = vec!["HMGET", key];
        args.extend_from_slice(fields);
        let value = self.command(&args).await?;
        as_opt_string_list("HMGET", &value)
    }

    async fn hash_fields_of_many(
        &self,
        keys: &[String],
        fields: &[&str],
    ) -> Result<Vec<Vec<Option<String>>>, TrackerError> {
        let mut out = Vec::with_capacity(keys.len());

        for chunk in keys.chunks(PIPELINE_CHUNK) {
            let commands: Vec<Vec<String>> = chunk
                .iter()
                .map(|key| {
                    let mut cmd = vec!["HMGET".to_string(), key.clone()];
                    cmd.extend(fields.iter().map(|f| (*f).to_string()));
                    cmd
                })
                .collect();

            for value in self.pipeline(&commands).await? {
                out.push(as_opt_string_list("HMGET", &value)?);
            }
        }

        Ok(out)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, TrackerError> {
        let value = self.command(&["GET", key]).await?;
        as_opt_string("GET", &value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), TrackerError> {
        self.command(&["SET", key, value]).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, TrackerError> {
        let value = self.command(&["DEL", key]).await?;
        Ok(value.as_i64().is_some_and(|n| n > 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_error_becomes_command_error() {
        let reply: Reply = serde_json::from_str(r#"{"error":"WRONGTYPE"}"#).unwrap();
        assert!(matches!(
            into_result("GET k", reply),
            Err(TrackerError::Command { .. })
        ));
    }

    #[test]
    fn hmget_reply_keeps_nulls() {
        let value = serde_json::json!(["1.5", null]);
        assert_eq!(
            as_opt_string_list("HMGET", &value).unwrap(),
            vec![Some("1.5".to_string()), None]
        );
    }

    #[test]
    fn numeric_replies_are_stringified() {
        assert_eq!(
            as_opt_string("GET", &serde_json::json!(1_700_000_000)).unwrap(),
            Some("1700000000".to_string())
        );
        assert!(as_opt_string("GET", &serde_json::json!({"a": 1})).is_err());
    }

    #[test]
    fn command_names_include_the_key() {
        assert_eq!(command_name(&["SMEMBERS", "changed_coords:guangfu"]), "SMEMBERS changed_coords:guangfu");
        assert_eq!(command_name(&["PING"]), "PING");
    }
}
