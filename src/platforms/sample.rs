//! Sample platform implementation
//!
//! A stub platform that demonstrates the IntegrationService interface: it
//! fans out one root stream per configured board, paginates each board with
//! child streams, and emits synthetic posts into the sink. Used by tests and
//! as a reference for implementing real platforms.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::context::{DataContext, RunContext, StreamContext};
use crate::error::HandlerError;
use crate::platforms::IntegrationService;
use crate::sink::MemberIdentity;

pub const SAMPLE_PLATFORM: &str = "sample";

/// Pages fetched per board before the traversal bottoms out.
const PAGES_PER_BOARD: i64 = 2;

/// Posts emitted per page.
const POSTS_PER_PAGE: i64 = 2;

pub struct SampleService;

impl SampleService {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SampleService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IntegrationService for SampleService {
    fn platform(&self) -> &str {
        SAMPLE_PLATFORM
    }

    async fn generate_streams(&self, ctx: &RunContext) -> Result<(), HandlerError> {
        let settings = &ctx.integration().settings;
        let boards: Vec<String> = settings
            .get("boards")
            .and_then(|b| b.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_else(|| vec!["general".to_string()]);

        for board in boards {
            ctx.publish_stream(
                &format!("posts:{board}"),
                Some(json!({"board": board, "page": 1})),
            )
            .await?;
        }

        Ok(())
    }

    async fn process_stream(&self, ctx: &StreamContext) -> Result<(), HandlerError> {
        let data = ctx.stream().data.clone().unwrap_or(json!({}));
        let board = data
            .get("board")
            .and_then(|b| b.as_str())
            .ok_or_else(|| HandlerError::abort("stream data is missing the board"))?
            .to_string();
        let page = data.get("page").and_then(|p| p.as_i64()).unwrap_or(1);

        for n in 1..=POSTS_PER_PAGE {
            ctx.publish_data(json!({
                "kind": "post",
                "sourceId": format!("{board}-p{page}-{n}"),
                "board": board,
                "author": format!("author-{n}"),
                "body": format!("post {n} on page {page} of {board}"),
            }))
            .await?;
        }

        if page < PAGES_PER_BOARD {
            ctx.publish_stream(
                &format!("posts:{board}:{}", page + 1),
                Some(json!({"board": board, "page": page + 1})),
            )
            .await?;
        }

        ctx.update_integration_settings(json!({
            "lastSync": Utc::now().to_rfc3339(),
        }))
        .await?;

        Ok(())
    }

    async fn process_data(&self, ctx: &DataContext) -> Result<(), HandlerError> {
        let payload = ctx.data();
        let source_id = payload
            .get("sourceId")
            .and_then(|s| s.as_str())
            .ok_or_else(|| HandlerError::abort("data payload is missing sourceId"))?;
        let author = payload
            .get("author")
            .and_then(|a| a.as_str())
            .unwrap_or("unknown");

        let identities = vec![MemberIdentity {
            platform: SAMPLE_PLATFORM.to_string(),
            username: author.to_string(),
        }];

        ctx.sink()
            .upsert_member(ctx.tenant_id(), &identities, payload)
            .await?;
        ctx.sink()
            .upsert_activity(ctx.tenant_id(), source_id, payload)
            .await?;

        Ok(())
    }
}
