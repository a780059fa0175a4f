//! Validation RPC fan-out: reconciliation queries pushed to connected
//! routers through the bounded send pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use trellis_domain::{Error, Result};
use trellis_protocol::msgs::{
    ValidateRouterDataModel, ValidateRouterDataModelResult, ValidateRouterLinks,
    ValidateRouterLinksResult, ValidateTerminators, ValidateTerminatorsResult,
};
use trellis_protocol::{ContentType, Frame};

use crate::fabric::RouterRegistry;

use super::{ControlChannel, SendPool};

/// Outcome of one router's validation RPC.
#[derive(Debug)]
pub struct RouterValidation<T> {
    pub router_id: String,
    pub result: Result<T>,
}

async fn send_validation<Req, Resp>(
    channel: Arc<dyn ControlChannel>,
    content_type: ContentType,
    request: Req,
    timeout: Duration,
) -> Result<Resp>
where
    Req: serde::Serialize,
    Resp: serde::de::DeserializeOwned,
{
    let frame = Frame::typed(content_type, &request)?;
    let reply = channel.send_for_reply(frame, timeout).await?;
    if !reply.is_success() {
        return Err(Error::Channel(reply.error_message().unwrap_or_else(|| {
            format!("validation rejected by router {}", channel.router_id())
        })));
    }
    Ok(reply.decode_body()?)
}

async fn fan_out<Req, Resp>(
    registry: &RouterRegistry,
    pool: &SendPool,
    router_ids: Vec<String>,
    content_type: ContentType,
    make_request: impl Fn(&str) -> Req + Send + Sync + 'static,
    timeout: Duration,
) -> mpsc::Receiver<RouterValidation<Resp>>
where
    Req: serde::Serialize + Send + 'static,
    Resp: serde::de::DeserializeOwned + Send + 'static,
{
    let (tx, rx) = mpsc::channel(router_ids.len().max(1));
    let make_request = Arc::new(make_request);

    for router_id in router_ids {
        let tx = tx.clone();
        let overflow_tx = tx.clone();
        let make_request = make_request.clone();
        let channel = registry.get_connected(&router_id).and_then(|r| r.channel());

        let job_router_id = router_id.clone();
        let job = async move {
            let result = match channel {
                Some(channel) => {
                    send_validation(channel, content_type, make_request(&job_router_id), timeout)
                        .await
                }
                None => Err(Error::Channel(format!(
                    "router {job_router_id} not connected"
                ))),
            };
            let _ = tx
                .send(RouterValidation {
                    router_id: job_router_id,
                    result,
                })
                .await;
        };

        // Enqueue blocks up to the caller's timeout; a full pool is an
        // explicit per-router Overloaded result, never a silent drop.
        if let Err(err) = pool.queue(timeout, job).await {
            let _ = overflow_tx
                .send(RouterValidation {
                    router_id,
                    result: Err(err),
                })
                .await;
        }
    }
    rx
}

/// Ask each terminator's router whether it still hosts it.
pub async fn validate_terminators(
    registry: &RouterRegistry,
    pool: &SendPool,
    by_router: Vec<(String, Vec<String>)>,
    timeout: Duration,
) -> mpsc::Receiver<RouterValidation<ValidateTerminatorsResult>> {
    let requests: std::collections::HashMap<String, Vec<String>> = by_router.into_iter().collect();
    let router_ids: Vec<String> = requests.keys().cloned().collect();
    fan_out(
        registry,
        pool,
        router_ids,
        ContentType::ValidateTerminators,
        move |router_id| ValidateTerminators {
            terminator_ids: requests.get(router_id).cloned().unwrap_or_default(),
        },
        timeout,
    )
    .await
}

/// Collect each router's link view for graph reconciliation.
pub async fn validate_router_links(
    registry: &RouterRegistry,
    pool: &SendPool,
    router_ids: Vec<String>,
    timeout: Duration,
) -> mpsc::Receiver<RouterValidation<ValidateRouterLinksResult>> {
    fan_out(
        registry,
        pool,
        router_ids,
        ContentType::ValidateRouterLinks,
        |_| ValidateRouterLinks,
        timeout,
    )
    .await
}

/// Collect each router's data-model index and content hash to detect
/// replica divergence.
pub async fn validate_router_data_model(
    registry: &RouterRegistry,
    pool: &SendPool,
    router_ids: Vec<String>,
    timeout: Duration,
) -> mpsc::Receiver<RouterValidation<ValidateRouterDataModelResult>> {
    fan_out(
        registry,
        pool,
        router_ids,
        ContentType::ValidateRouterDataModel,
        |_| ValidateRouterDataModel,
        timeout,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::StubChannel;
    use trellis_domain::model::Router;

    fn registry_with(router_id: &str, responder: Arc<StubChannel>) -> RouterRegistry {
        let registry = RouterRegistry::new();
        registry.put(Router {
            id: router_id.into(),
            name: router_id.into(),
            ..Default::default()
        });
        registry
            .mark_connected(router_id, responder, "1.0.0".into(), vec![], None)
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn terminator_validation_round_trips() {
        let channel = Arc::new(StubChannel::with_responder("r1", |frame| {
            let request: ValidateTerminators = frame.decode_body().unwrap();
            let body = ValidateTerminatorsResult {
                valid: request.terminator_ids.clone(),
                invalid: vec![],
            };
            Ok(
                Frame::typed(ContentType::ValidateTerminatorsResult, &body)
                    .unwrap()
                    .with_success(),
            )
        }));
        let registry = registry_with("r1", channel);
        let pool = SendPool::new(8, 2);

        let mut results = validate_terminators(
            &registry,
            &pool,
            vec![("r1".into(), vec!["t1".into(), "t2".into()])],
            Duration::from_secs(1),
        )
        .await;
        let outcome = results.recv().await.unwrap();
        assert_eq!(outcome.router_id, "r1");
        let result = outcome.result.unwrap();
        assert_eq!(result.valid, vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn disconnected_router_reports_channel_error() {
        let registry = RouterRegistry::new();
        registry.put(Router {
            id: "r9".into(),
            name: "r9".into(),
            ..Default::default()
        });
        let pool = SendPool::new(8, 2);

        let mut results = validate_router_links(
            &registry,
            &pool,
            vec!["r9".into()],
            Duration::from_secs(1),
        )
        .await;
        let outcome = results.recv().await.unwrap();
        assert!(matches!(outcome.result, Err(Error::Channel(_))));
    }
}
