//! Procedure dispatch for incoming requests

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::connection::{RpcSender, RpcStream};
use super::message::{ErrorBody, ProcedureName, ProcedureType, Request};
use crate::error::NodeResult;
use crate::identity::IdentityRef;

/// Everything a handler gets for one incoming request.
pub struct IncomingRequest {
    pub remote: IdentityRef,
    pub request: Request,
    /// Reply channel. Closed normally when the handler returns `Ok`, with
    /// an error otherwise.
    pub sender: RpcSender,
    /// Packets the remote sends on `sink` and `duplex` requests
    pub stream: Option<RpcStream>,
    /// Cancelled when the connection closes
    pub cancel: CancellationToken,
}

/// Serves one procedure.
pub trait Handler: Send + Sync + 'static {
    fn procedure_type(&self) -> ProcedureType;

    fn handle(&self, request: IncomingRequest) -> BoxFuture<'static, NodeResult<()>>;
}

/// Maps procedure names to handlers.
#[derive(Default, Clone)]
pub struct Router {
    handlers: HashMap<ProcedureName, Arc<dyn Handler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: Handler>(&mut self, name: impl Into<ProcedureName>, handler: H) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn procedures(&self) -> impl Iterator<Item = &ProcedureName> {
        self.handlers.keys()
    }

    /// Find the handler for `request`, or the error to answer it with.
    pub(crate) fn resolve(&self, request: &Request) -> Result<Arc<dyn Handler>, ErrorBody> {
        let handler = self
            .handlers
            .get(&request.name)
            .ok_or_else(|| ErrorBody::method_not_supported(&request.name))?;
        let expected = handler.procedure_type();
        if expected != request.typ {
            return Err(ErrorBody::new(format!(
                "procedure {} is {}, not {}",
                request.name, expected, request.typ
            )));
        }
        Ok(handler.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;

    struct Noop;

    impl Handler for Noop {
        fn procedure_type(&self) -> ProcedureType {
            ProcedureType::Source
        }

        fn handle(&self, _request: IncomingRequest) -> BoxFuture<'static, NodeResult<()>> {
            async { Ok(()) }.boxed()
        }
    }

    #[test]
    fn test_resolve() {
        let mut router = Router::new();
        router.register("createHistoryStream", Noop);

        let ok = Request::new("createHistoryStream".into(), ProcedureType::Source, json!([]));
        assert!(router.resolve(&ok).is_ok());

        let wrong_type = Request::new("createHistoryStream".into(), ProcedureType::Duplex, json!([]));
        let err = router.resolve(&wrong_type).err().unwrap();
        assert_eq!(err.message, "procedure createHistoryStream is source, not duplex");

        let unknown = Request::new("ebt.replicate".into(), ProcedureType::Duplex, json!([]));
        let err = router.resolve(&unknown).err().unwrap();
        assert_eq!(err.message, "method not supported: ebt.replicate");
    }
}
