use std::{sync::Arc, time::Duration};

use tokio::time::Instant;
use tonic::Status;
use tracing::{info, warn};

use crate::{
    admission::{AdmissionController, Rejection},
    log::Appended,
    logging::ACCESS_TARGET,
    metrics::OutcomeMetrics,
    proto::{Errno, Request, Response, proxy::proxy_server::Proxy},
    publisher::{PublishError, Publisher},
};

/// The `Do` RPC: admission, then publish.
#[derive(Clone)]
pub struct ProxyService {
    admission: Arc<AdmissionController>,
    publisher: Publisher,
    metrics: OutcomeMetrics,
    publish_timeout: Duration,
}

impl ProxyService {
    pub fn new(
        admission: Arc<AdmissionController>,
        publisher: Publisher,
        metrics: OutcomeMetrics,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            admission,
            publisher,
            metrics,
            publish_timeout,
        }
    }

    pub async fn handle(&self, req: Request) -> Result<Response, Status> {
        let started = Instant::now();
        let mut trace = Trace::default();
        let result = self.admit_and_publish(&req, &mut trace).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        // Every answered RPC counts as a success, errno included.
        self.metrics.observe(result.is_ok(), elapsed_ms);
        let key = trace.key.as_deref().map(String::from_utf8_lossy);
        let key = key.as_deref();
        let partition = trace.appended.map(|a| a.partition);
        let offset = trace.appended.map(|a| a.offset);
        match &result {
            Ok(resp) => info!(
                target: ACCESS_TARGET,
                cmd = %req.cmd,
                key,
                partition,
                offset,
                args = req.args.len(),
                errno = resp.errno().as_str_name(),
                elapsed_ms,
                "do"
            ),
            Err(status) => info!(
                target: ACCESS_TARGET,
                cmd = %req.cmd,
                key,
                args = req.args.len(),
                code = ?status.code(),
                message = status.message(),
                elapsed_ms,
                "do"
            ),
        }
        result
    }

    async fn admit_and_publish(
        &self,
        req: &Request,
        trace: &mut Trace,
    ) -> Result<Response, Status> {
        let admitted = match self.admission.admit(req).await {
            Ok(admitted) => admitted,
            Err(Rejection::RateLimited) => {
                return Ok(reply(Errno::Ratelimit, Rejection::RateLimited.to_string()));
            }
            Err(err @ (Rejection::InvalidArgument(_) | Rejection::Unsupported(_))) => {
                return Err(Status::invalid_argument(err.to_string()));
            }
        };

        let publish = self.publisher.publish(req, &admitted.ordering_key);
        let result = match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout),
        };
        trace.key = Some(admitted.ordering_key);

        match result {
            Ok(appended) => {
                trace.appended = Some(appended);
                Ok(reply(Errno::Ok, String::new()))
            }
            Err(err @ PublishError::PayloadTooLarge { .. }) => {
                Ok(reply(Errno::SizeTooLarge, err.to_string()))
            }
            Err(err) => {
                warn!(cmd = %admitted.command, error = %err, "publish failed");
                Err(Status::internal(err.to_string()))
            }
        }
    }
}

/// What a call got to, for its access entry.
#[derive(Default)]
struct Trace {
    key: Option<Vec<u8>>,
    appended: Option<Appended>,
}

fn reply(errno: Errno, message: String) -> Response {
    Response {
        errno: errno as i32,
        message,
    }
}

#[tonic::async_trait]
impl Proxy for ProxyService {
    async fn r#do(
        &self,
        request: tonic::Request<Request>,
    ) -> Result<tonic::Response<Response>, Status> {
        self.handle(request.into_inner())
            .await
            .map(tonic::Response::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::{Catalog, CommandDescriptor},
        log::{LogError, LogProducer},
        logging::capture::AccessEntries,
        metrics::Metrics,
        ratelimit::TokenBucket,
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct Fixed(Result<(), ()>);

    #[async_trait]
    impl LogProducer for Fixed {
        async fn append(&self, _: &str, _: &[u8], _: &[u8]) -> Result<Appended, LogError> {
            match self.0 {
                Ok(()) => Ok(Appended {
                    partition: 3,
                    offset: 7,
                }),
                Err(()) => Err(LogError::Closed),
            }
        }
    }

    struct Stalled;

    #[async_trait]
    impl LogProducer for Stalled {
        async fn append(&self, _: &str, _: &[u8], _: &[u8]) -> Result<Appended, LogError> {
            std::future::pending().await
        }
    }

    fn service(producer: Arc<dyn LogProducer>, tps: u64, max_bytes: usize) -> (ProxyService, Metrics) {
        let catalog = Catalog::build(
            vec![
                CommandDescriptor::new("set", 3, 1),
                CommandDescriptor::new("hset", -4, 1),
            ],
            &["set".into(), "hset".into()],
        )
        .unwrap();
        let admission = AdmissionController::new(
            Arc::new(catalog),
            Arc::new(TokenBucket::with_rate(tps)),
            Duration::from_millis(100),
        );
        let metrics = Metrics::new().unwrap();
        let svc = ProxyService::new(
            Arc::new(admission),
            Publisher::new(producer, "kvbuf".into(), max_bytes),
            metrics.requests.clone(),
            Duration::from_secs(1),
        );
        (svc, metrics)
    }

    fn req(cmd: &str, args: &[&str]) -> Request {
        Request {
            cmd: cmd.to_string(),
            args: args.iter().map(|a| a.as_bytes().to_vec()).collect(),
        }
    }

    #[tokio::test]
    async fn maps_outcomes_to_errno_and_status() {
        let (svc, metrics) = service(Arc::new(Fixed(Ok(()))), 1000, 64);

        let resp = svc.handle(req("set", &["k1", "v1"])).await.unwrap();
        assert_eq!(resp.errno(), Errno::Ok);

        let status = svc.handle(req("hset", &["k1", "f1"])).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = svc.handle(req("del", &["k1"])).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let big = "x".repeat(128);
        let resp = svc.handle(req("set", &["k1", &big])).await.unwrap();
        assert_eq!(resp.errno(), Errno::SizeTooLarge);

        // Answered with an errno is still a successful RPC.
        assert_eq!(metrics.requests.processed.get(), 4);
        assert_eq!(metrics.requests.succeeded.get(), 2);
        assert_eq!(metrics.requests.failed.get(), 2);
    }

    #[tokio::test]
    async fn access_entry_names_key_partition_and_offset() {
        let (entries, _guard) = AccessEntries::install();
        let (svc, _metrics) = service(Arc::new(Fixed(Ok(()))), 1000, 64);

        svc.handle(req("set", &["k1", "v1"])).await.unwrap();
        svc.handle(req("hset", &["k2", "f1"])).await.unwrap_err();

        let entries = entries.take();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["cmd"], "set");
        assert_eq!(entries[0]["key"], "k1");
        assert_eq!(entries[0]["partition"], "3");
        assert_eq!(entries[0]["offset"], "7");
        assert_eq!(entries[0]["errno"], "OK");
        assert!(!entries[1].contains_key("key"));
        assert!(!entries[1].contains_key("offset"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_is_a_successful_rpc() {
        let (svc, metrics) = service(Arc::new(Fixed(Ok(()))), 1, 64);
        assert_eq!(
            svc.handle(req("set", &["k", "v"])).await.unwrap().errno(),
            Errno::Ok
        );
        let resp = svc.handle(req("set", &["k", "v"])).await.unwrap();
        assert_eq!(resp.errno(), Errno::Ratelimit);
        assert_eq!(resp.message, "ratelimit reached");
        assert_eq!(metrics.requests.succeeded.get(), 2);
        assert_eq!(metrics.requests.failed.get(), 0);
    }

    #[tokio::test]
    async fn log_failure_is_internal() {
        let (svc, metrics) = service(Arc::new(Fixed(Err(()))), 1000, 64);
        let status = svc.handle(req("set", &["k1", "v1"])).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(metrics.requests.failed.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_append_times_out() {
        let (svc, _metrics) = service(Arc::new(Stalled), 1000, 64);
        let status = svc.handle(req("set", &["k1", "v1"])).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(status.message(), "publish timed out");
    }
}
