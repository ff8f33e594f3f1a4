use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::wecom::token_cache::TokenCache;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error, info};

/// Send-capable surface of the messaging platform, so the service layer can
/// run against a recording double in tests.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Obtain an access token for the tenant (cached internally)
    async fn get_token(&self, corp_id: &str, corp_secret: &str) -> AppResult<String>;

    /// Send a text message; returns the platform's response verbatim
    async fn send_text(
        &self,
        token: &str,
        agent_id: i64,
        recipients: &str,
        content: &str,
    ) -> AppResult<serde_json::Value>;

    /// Enumerate members visible to the credential (for the recipient picker)
    async fn list_members(&self, token: &str) -> AppResult<Vec<MemberInfo>>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    7200
}

#[derive(Debug, Deserialize)]
struct DepartmentListResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    department: Vec<DepartmentInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepartmentInfo {
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct UserListResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    userlist: Vec<RawUser>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawUser {
    userid: String,
    #[serde(default)]
    name: String,
}

/// A platform member, as shown in the recipient picker
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MemberInfo {
    pub userid: String,
    pub name: String,
    pub department: String,
}

#[derive(Debug, Serialize)]
struct SendMessageBody<'a> {
    touser: &'a str,
    msgtype: &'static str,
    agentid: i64,
    text: SendMessageText<'a>,
}

#[derive(Debug, Serialize)]
struct SendMessageText<'a> {
    content: &'a str,
}

/// Client for the WeCom HTTP API
pub struct WecomClient {
    http: Client,
    api_base: String,
    cache: TokenCache,
    token_margin: Duration,
}

impl std::fmt::Debug for WecomClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WecomClient")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl WecomClient {
    /// Create a new client from config
    pub fn new(config: &AppConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.wecom.timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http,
            api_base: config.wecom.api_base.trim_end_matches('/').to_string(),
            cache: TokenCache::new(),
            token_margin: Duration::from_secs(config.wecom.token_margin_secs),
        }
    }

    fn check_errcode(errcode: i64, errmsg: &str) -> AppResult<()> {
        if errcode != 0 {
            return Err(AppError::Upstream {
                code: errcode,
                message: errmsg.to_string(),
            });
        }
        Ok(())
    }

    async fn list_departments(&self, token: &str) -> AppResult<Vec<DepartmentInfo>> {
        let url = format!("{}/cgi-bin/department/list", self.api_base);
        let response: DepartmentListResponse = self
            .http
            .get(&url)
            .query(&[("access_token", token)])
            .send()
            .await?
            .json()
            .await?;

        Self::check_errcode(response.errcode, &response.errmsg)?;
        Ok(response.department)
    }

    async fn list_department_users(
        &self,
        token: &str,
        department_id: i64,
    ) -> AppResult<Vec<RawUser>> {
        let url = format!("{}/cgi-bin/user/list", self.api_base);
        let response: UserListResponse = self
            .http
            .get(&url)
            .query(&[
                ("access_token", token.to_string()),
                ("department_id", department_id.to_string()),
            ])
            .send()
            .await?
            .json()
            .await?;

        Self::check_errcode(response.errcode, &response.errmsg)?;
        Ok(response.userlist)
    }
}

#[async_trait]
impl PlatformApi for WecomClient {
    async fn get_token(&self, corp_id: &str, corp_secret: &str) -> AppResult<String> {
        if let Some(token) = self.cache.get(corp_id, corp_secret) {
            debug!("Using cached access token for corp {}", corp_id);
            return Ok(token);
        }

        let url = format!("{}/cgi-bin/gettoken", self.api_base);
        let response: TokenResponse = self
            .http
            .get(&url)
            .query(&[("corpid", corp_id), ("corpsecret", corp_secret)])
            .send()
            .await?
            .json()
            .await?;

        Self::check_errcode(response.errcode, &response.errmsg)?;

        // Expire early so a token is never used at the platform's TTL edge
        let ttl = Duration::from_secs(response.expires_in)
            .saturating_sub(self.token_margin);
        self.cache
            .insert(corp_id, corp_secret, response.access_token.clone(), ttl);

        info!("Fetched new access token for corp {}", corp_id);
        Ok(response.access_token)
    }

    async fn send_text(
        &self,
        token: &str,
        agent_id: i64,
        recipients: &str,
        content: &str,
    ) -> AppResult<serde_json::Value> {
        let url = format!(
            "{}/cgi-bin/message/send?access_token={}",
            self.api_base, token
        );
        let body = SendMessageBody {
            touser: recipients,
            msgtype: "text",
            agentid: agent_id,
            text: SendMessageText { content },
        };

        let response: serde_json::Value =
            self.http.post(&url).json(&body).send().await?.json().await?;

        let errcode = response
            .get("errcode")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(-1);
        if errcode != 0 {
            let errmsg = response
                .get("errmsg")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown error");
            error!("Message send failed: {} ({})", errmsg, errcode);
            return Err(AppError::Upstream {
                code: errcode,
                message: errmsg.to_string(),
            });
        }

        Ok(response)
    }

    async fn list_members(&self, token: &str) -> AppResult<Vec<MemberInfo>> {
        let departments = self.list_departments(token).await?;
        let mut members = Vec::new();
        let mut seen = HashSet::new();

        for dept in departments {
            let users = self.list_department_users(token, dept.id).await?;
            for user in users {
                if seen.insert(user.userid.clone()) {
                    members.push(MemberInfo {
                        userid: user.userid,
                        name: user.name,
                        department: dept.name.clone(),
                    });
                }
            }
        }

        Ok(members)
    }
}
