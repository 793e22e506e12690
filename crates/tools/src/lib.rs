use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use outreach_persistence::{ExecutorsRepo, UsersRepo};
use serde::{Deserialize, Serialize};

// ── Tool trait and registry ──────────────────────────────────────────────────

/// Describes a single parameter that a tool accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    pub description: String,
    pub required: bool,
}

/// Static metadata about a tool, used by the assistant to decide which tool
/// to call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ToolParam>,
}

/// The result returned after a tool runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
}

/// Per-call context: which prospect the call is acting on and the
/// repositories needed to act on them. Shared across calls, so cloning it
/// must stay cheap — both repos just wrap a pooled connection handle.
#[derive(Clone)]
pub struct ToolContext {
    pub user_id: i64,
    pub users: UsersRepo,
    pub executors: ExecutorsRepo,
}

/// Trait implemented by every tool the assistant can call.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn run(&self, ctx: &ToolContext, args: &HashMap<String, String>) -> Result<ToolOutput>;
}

/// Central registry for all available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn list_specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.spec().name == name)
            .map(|t| t.as_ref())
    }
}

// ── Phone normalization ───────────────────────────────────────────────────────

/// Normalizes a free-form phone number to `+7XXXXXXXXXX`. Returns `None` if
/// the digit count doesn't match a plausible Russian mobile number.
pub fn normalize_phone(phone: &str) -> Option<String> {
    if phone.is_empty() {
        return None;
    }
    let mut digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.len() == 11 && (digits.starts_with('7') || digits.starts_with('8')) {
        digits = format!("7{}", &digits[1..]);
    } else if digits.len() == 10 {
        digits = format!("7{digits}");
    } else if digits.len() != 11 {
        return None;
    }

    Some(format!("+{digits}"))
}

// ── get_link ──────────────────────────────────────────────────────────────────

/// Resolves a dotted key path (e.g. `"pricing.basic"`) against a static
/// catalog of links, loaded once at startup.
pub struct GetLinkTool {
    catalog: serde_json::Value,
}

impl GetLinkTool {
    pub fn new(catalog: serde_json::Value) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl Tool for GetLinkTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "get_link".to_string(),
            description: "Look up a shareable link by its dotted catalog key.".to_string(),
            params: vec![ToolParam {
                name: "key".to_string(),
                description: "Dotted path into the link catalog, e.g. `pricing.basic`.".to_string(),
                required: true,
            }],
        }
    }

    async fn run(&self, _ctx: &ToolContext, args: &HashMap<String, String>) -> Result<ToolOutput> {
        let key = args.get("key").cloned().unwrap_or_default();
        let mut current = &self.catalog;
        let mut found = true;
        for segment in key.split('.').filter(|s| !s.is_empty()) {
            match current.get(segment) {
                Some(next) => current = next,
                None => {
                    found = false;
                    break;
                }
            }
        }

        let output = match (found, current.as_str()) {
            (true, Some(link)) => link.to_string(),
            _ => "link not found".to_string(),
        };
        Ok(ToolOutput { success: found, output })
    }
}

// ── save_user_phone ───────────────────────────────────────────────────────────

pub struct SaveUserPhoneTool;

#[async_trait]
impl Tool for SaveUserPhoneTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "save_user_phone".to_string(),
            description: "Save the prospect's phone number, normalized to +7XXXXXXXXXX.".to_string(),
            params: vec![ToolParam {
                name: "phone".to_string(),
                description: "Phone number in any common format.".to_string(),
                required: true,
            }],
        }
    }

    async fn run(&self, ctx: &ToolContext, args: &HashMap<String, String>) -> Result<ToolOutput> {
        let raw = args.get("phone").cloned().unwrap_or_default();
        match normalize_phone(&raw) {
            Some(normalized) => {
                ctx.users.update_param(ctx.user_id, "phone", &normalized).await?;
                Ok(ToolOutput { success: true, output: "phone saved".to_string() })
            }
            None => Ok(ToolOutput { success: false, output: "not a valid phone number".to_string() }),
        }
    }
}

// ── save_user_name ────────────────────────────────────────────────────────────

pub struct SaveUserNameTool;

#[async_trait]
impl Tool for SaveUserNameTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "save_user_name".to_string(),
            description: "Save the prospect's display name.".to_string(),
            params: vec![ToolParam {
                name: "name".to_string(),
                description: "The prospect's name, as given in conversation.".to_string(),
                required: true,
            }],
        }
    }

    async fn run(&self, ctx: &ToolContext, args: &HashMap<String, String>) -> Result<ToolOutput> {
        let name = args.get("name").cloned().unwrap_or_default();
        ctx.users.update_param(ctx.user_id, "display_name", &name).await?;
        Ok(ToolOutput { success: true, output: "name saved".to_string() })
    }
}

// ── ban_user ───────────────────────────────────────────────────────────────────

pub struct BanUserTool;

#[async_trait]
impl Tool for BanUserTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "ban_user".to_string(),
            description: "Mark the prospect as banned, ending outreach to them.".to_string(),
            params: vec![],
        }
    }

    async fn run(&self, ctx: &ToolContext, _args: &HashMap<String, String>) -> Result<ToolOutput> {
        ctx.users.update_param(ctx.user_id, "banned", "1").await?;
        ctx.users.unassign_executor(&ctx.executors, ctx.user_id).await?;
        Ok(ToolOutput { success: true, output: "user banned".to_string() })
    }
}

// ── process_user_agreement ───────────────────────────────────────────────────

/// Minimal shape of the CRM intake webhook: a form post carrying the
/// prospect's contact details and the conversation summary that led to
/// the handoff.
#[async_trait]
pub trait CrmClient: Send + Sync {
    async fn submit(&self, name: &str, phone: Option<&str>, telegram: Option<&str>, note: &str) -> Result<bool>;
}

/// Posts the lead to a configured webhook endpoint as form-encoded fields.
pub struct HttpCrmClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCrmClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), endpoint: endpoint.into() }
    }
}

#[async_trait]
impl CrmClient for HttpCrmClient {
    async fn submit(&self, name: &str, phone: Option<&str>, telegram: Option<&str>, note: &str) -> Result<bool> {
        let form = [
            ("name", name),
            ("phone", phone.unwrap_or_default()),
            ("telegram", telegram.unwrap_or_default()),
            ("note", note),
        ];
        let response = self.client.post(&self.endpoint).form(&form).send().await;
        match response {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(err) => {
                tracing::warn!(error = %err, "CRM submission failed");
                Ok(false)
            }
        }
    }
}

pub struct ProcessUserAgreementTool<C: CrmClient> {
    crm: C,
}

impl<C: CrmClient> ProcessUserAgreementTool<C> {
    pub fn new(crm: C) -> Self {
        Self { crm }
    }
}

#[async_trait]
impl<C: CrmClient> Tool for ProcessUserAgreementTool<C> {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "process_user_agreement".to_string(),
            description: "Record that the prospect agreed to a call and hand the lead to CRM.".to_string(),
            params: vec![ToolParam {
                name: "summary".to_string(),
                description: "Short summary of the conversation to attach to the lead.".to_string(),
                required: true,
            }],
        }
    }

    async fn run(&self, ctx: &ToolContext, args: &HashMap<String, String>) -> Result<ToolOutput> {
        let summary = args.get("summary").cloned().unwrap_or_default();
        ctx.users.update_param(ctx.user_id, "summary", &summary).await?;

        let user = ctx.users.get_user(ctx.user_id).await?;
        let Some(user) = user else {
            return Ok(ToolOutput { success: false, output: "user not found".to_string() });
        };
        let name = user
            .display_name
            .filter(|n| !n.is_empty())
            .or_else(|| user.username.clone())
            .unwrap_or_default();

        let success = self
            .crm
            .submit(&name, user.phone.as_deref(), user.username.as_deref(), &summary)
            .await?;

        if success {
            ctx.users.update_param(ctx.user_id, "crm", "1").await?;
            Ok(ToolOutput { success: true, output: "agreement recorded, lead sent to CRM".to_string() })
        } else {
            Ok(ToolOutput { success: false, output: "CRM submission failed, try again".to_string() })
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────────────
