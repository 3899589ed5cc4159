//! Helix `/polls` client.

use std::time::Duration;

use {
    async_trait::async_trait,
    pollcast_config::TwitchConfig,
    pollcast_polls::provider::{
        CreatePollRequest, EndPollStatus, NativePollApi, ProviderAuth, ProviderError,
        ProviderResult, RemotePoll, RemotePollStatus,
    },
    reqwest::{RequestBuilder, StatusCode, header::HeaderMap},
    secrecy::ExposeSecret,
    serde::Deserialize,
    serde_json::json,
    tracing::debug,
    url::Url,
};

use crate::error::{Error, Result};

/// Helix rejects longer poll titles.
const TITLE_MAX_CHARS: usize = 60;
/// Helix rejects longer choice titles.
const CHOICE_MAX_CHARS: usize = 25;

#[derive(Debug, Deserialize)]
struct PollsEnvelope {
    data: Vec<HelixPoll>,
}

#[derive(Debug, Deserialize)]
struct HelixPoll {
    id: String,
    status: String,
    #[serde(default)]
    choices: Vec<HelixChoice>,
}

#[derive(Debug, Deserialize)]
struct HelixChoice {
    #[serde(default)]
    votes: u64,
}

impl From<HelixPoll> for RemotePoll {
    fn from(poll: HelixPoll) -> Self {
        Self {
            id: poll.id,
            status: RemotePollStatus::from_provider(&poll.status),
            votes: poll.choices.iter().map(|c| c.votes).collect(),
        }
    }
}

pub struct HelixClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
}

impl HelixClient {
    pub fn new(config: &TwitchConfig) -> Result<Self> {
        let client_id = config
            .client_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or(Error::MissingClientId)?;
        Url::parse(&config.api_base_url)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            client_id,
        })
    }

    fn polls_url(&self) -> String {
        format!("{}/polls", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder, auth: &ProviderAuth) -> RequestBuilder {
        request
            .header("Client-Id", &self.client_id)
            .bearer_auth(auth.access_token.expose_secret())
    }

    async fn send(&self, request: RequestBuilder) -> ProviderResult<RemotePoll> {
        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ProviderError::Unauthorized);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after(response.headers()),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: PollsEnvelope = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        envelope
            .data
            .into_iter()
            .next()
            .map(RemotePoll::from)
            .ok_or_else(|| ProviderError::Decode("empty poll list".into()))
    }
}

#[async_trait]
impl NativePollApi for HelixClient {
    async fn create_poll(
        &self,
        auth: &ProviderAuth,
        request: &CreatePollRequest,
    ) -> ProviderResult<RemotePoll> {
        let choices: Vec<_> = request
            .choices
            .iter()
            .map(|c| json!({ "title": truncate(c, CHOICE_MAX_CHARS) }))
            .collect();
        let body = json!({
            "broadcaster_id": auth.broadcaster_id,
            "title": truncate(&request.title, TITLE_MAX_CHARS),
            "choices": choices,
            "duration": request.duration_secs,
        });
        debug!(broadcaster_id = %auth.broadcaster_id, "creating helix poll");
        self.send(self.authorized(self.http.post(self.polls_url()), auth).json(&body))
            .await
    }

    async fn get_poll(&self, auth: &ProviderAuth, remote_id: &str) -> ProviderResult<RemotePoll> {
        let request = self
            .http
            .get(self.polls_url())
            .query(&[("broadcaster_id", auth.broadcaster_id.as_str()), ("id", remote_id)]);
        self.send(self.authorized(request, auth)).await
    }

    async fn end_poll(
        &self,
        auth: &ProviderAuth,
        remote_id: &str,
        status: EndPollStatus,
    ) -> ProviderResult<RemotePoll> {
        let body = json!({
            "broadcaster_id": auth.broadcaster_id,
            "id": remote_id,
            "status": status.as_str(),
        });
        self.send(self.authorized(self.http.patch(self.polls_url()), auth).json(&body))
            .await
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Seconds until the rate-limit bucket refills, from `Ratelimit-Reset`
/// (epoch seconds) or `Retry-After`.
fn retry_after(headers: &HeaderMap) -> Option<u64> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    };
    if let Some(reset) = header("ratelimit-reset") {
        let now = u64::try_from(pollcast_common::time::now().timestamp()).unwrap_or(0);
        return Some(reset.saturating_sub(now));
    }
    header("retry-after")
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, mockito::Matcher, secrecy::Secret};

    fn client(server: &mockito::Server) -> HelixClient {
        HelixClient::new(&TwitchConfig {
            client_id: Some("cid".into()),
            api_base_url: server.url(),
            ..TwitchConfig::default()
        })
        .unwrap()
    }

    fn auth() -> ProviderAuth {
        ProviderAuth {
            broadcaster_id: "b1".into(),
            access_token: Secret::new("tok".into()),
        }
    }

    fn poll_body(status: &str, votes: &[u64]) -> String {
        let choices: Vec<_> = votes
            .iter()
            .enumerate()
            .map(|(i, v)| json!({ "id": format!("c{i}"), "title": format!("opt {i}"), "votes": v }))
            .collect();
        json!({ "data": [{ "id": "p1", "status": status, "choices": choices }] }).to_string()
    }

    #[test]
    fn missing_client_id_is_rejected() {
        assert!(matches!(
            HelixClient::new(&TwitchConfig::default()),
            Err(Error::MissingClientId)
        ));
    }

    #[tokio::test]
    async fn create_sends_truncated_poll() {
        let mut server = mockito::Server::new_async().await;
        let long_title = "q".repeat(80);
        let mock = server
            .mock("POST", "/polls")
            .match_header("client-id", "cid")
            .match_header("authorization", "Bearer tok")
            .match_body(Matcher::PartialJson(json!({
                "broadcaster_id": "b1",
                "title": "q".repeat(60),
                "choices": [{ "title": "Red" }, { "title": "a".repeat(25) }],
                "duration": 60,
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(poll_body("ACTIVE", &[0, 0]))
            .create_async()
            .await;

        let remote = client(&server)
            .create_poll(&auth(), &CreatePollRequest {
                title: long_title,
                choices: vec!["Red".into(), "a".repeat(40)],
                duration_secs: 60,
            })
            .await
            .unwrap();
        assert_eq!(remote.id, "p1");
        assert_eq!(remote.status, RemotePollStatus::Active);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn get_reads_votes_per_choice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/polls")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("broadcaster_id".into(), "b1".into()),
                Matcher::UrlEncoded("id".into(), "p1".into()),
            ]))
            .with_status(200)
            .with_body(poll_body("COMPLETED", &[4, 9, 1]))
            .create_async()
            .await;

        let remote = client(&server).get_poll(&auth(), "p1").await.unwrap();
        assert_eq!(remote.votes, vec![4, 9, 1]);
        assert_eq!(remote.status, RemotePollStatus::Completed);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn end_patches_status() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PATCH", "/polls")
            .match_body(Matcher::Json(json!({
                "broadcaster_id": "b1",
                "id": "p1",
                "status": "TERMINATED",
            })))
            .with_status(200)
            .with_body(poll_body("TERMINATED", &[1, 1]))
            .create_async()
            .await;

        let remote = client(&server)
            .end_poll(&auth(), "p1", EndPollStatus::Terminated)
            .await
            .unwrap();
        assert_eq!(remote.status, RemotePollStatus::Terminated);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_token_is_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/polls")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body(r#"{"error":"Unauthorized","status":401,"message":"Invalid OAuth token"}"#)
            .create_async()
            .await;

        let err = client(&server).get_poll(&auth(), "p1").await.unwrap_err();
        assert!(err.is_unauthorized());
    }

    #[tokio::test]
    async fn rate_limit_reports_retry_delay() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/polls")
            .match_query(Matcher::Any)
            .with_status(429)
            .with_header("retry-after", "7")
            .create_async()
            .await;

        let err = client(&server).get_poll(&auth(), "p1").await.unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited {
            retry_after_secs: Some(7)
        }));
    }

    #[tokio::test]
    async fn server_error_keeps_status_and_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/polls")
            .with_status(400)
            .with_body("poll already active")
            .create_async()
            .await;

        let err = client(&server)
            .create_poll(&auth(), &CreatePollRequest {
                title: "t".into(),
                choices: vec!["a".into(), "b".into()],
                duration_secs: 15,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Http { status: 400, ref body } if body == "poll already active"));
    }

    #[tokio::test]
    async fn empty_data_is_a_decode_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/polls")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"data":[]}"#)
            .create_async()
            .await;

        let err = client(&server).get_poll(&auth(), "p1").await.unwrap_err();
        assert!(matches!(err, ProviderError::Decode(_)));
    }
}
