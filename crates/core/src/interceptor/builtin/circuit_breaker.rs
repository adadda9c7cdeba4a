//! Circuit breaker admission and outcome recording

use std::sync::Arc;

use async_trait::async_trait;
use netguard_domain::{NetError, NetRequest, NetResponse};
use tracing::debug;

use super::{priority, CIRCUIT_BREAKER};
use crate::breaker::CircuitBreakerRegistry;
use crate::interceptor::chain::{
    ErrorDisposition, ErrorHandler, ErrorInterceptor, InterceptorChain, RequestHandler,
    RequestInterceptor, ResponseHandler, ResponseInterceptor,
};
use crate::interceptor::context::{CallContext, META_BREAKER_ADMITTED, META_SKIP_CIRCUIT_BREAKER};

/// Rejects calls to services whose breaker is open and records the verdict
/// of every admitted call.
pub struct CircuitBreakerInterceptor {
    registry: CircuitBreakerRegistry,
}

impl CircuitBreakerInterceptor {
    pub fn new(registry: CircuitBreakerRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &CircuitBreakerRegistry {
        &self.registry
    }

    pub fn install(self: Arc<Self>, chain: &InterceptorChain) {
        chain.add_request_interceptor(RequestInterceptor::from_arc(
            CIRCUIT_BREAKER,
            priority::BREAKER_REQUEST,
            self.clone(),
        ));
        chain.add_response_interceptor(ResponseInterceptor::from_arc(
            CIRCUIT_BREAKER,
            priority::BREAKER_RESPONSE,
            self.clone(),
        ));
        chain.add_error_interceptor(ErrorInterceptor::from_arc(
            CIRCUIT_BREAKER,
            priority::BREAKER_ERROR,
            self,
        ));
    }
}

#[async_trait]
impl RequestHandler for CircuitBreakerInterceptor {
    async fn handle(&self, request: NetRequest, ctx: &mut CallContext) -> Result<NetRequest, NetError> {
        if ctx.flag(META_SKIP_CIRCUIT_BREAKER) {
            return Ok(request);
        }
        self.registry.admit(&ctx.service_key)?;
        ctx.set_flag(META_BREAKER_ADMITTED, true);
        Ok(request)
    }
}

#[async_trait]
impl ResponseHandler for CircuitBreakerInterceptor {
    async fn handle(&self, response: NetResponse, ctx: &mut CallContext) -> Result<NetResponse, NetError> {
        if ctx.take_flag(META_BREAKER_ADMITTED) {
            self.registry.record_success(&ctx.service_key);
        }
        Ok(response)
    }
}

#[async_trait]
impl ErrorHandler for CircuitBreakerInterceptor {
    fn can_handle(&self, error: &NetError) -> bool {
        // Our own rejection carries no verdict about the service
        error.kind != netguard_domain::ErrorKind::CircuitOpen
    }

    async fn handle(&self, error: NetError, ctx: &mut CallContext) -> Result<ErrorDisposition, NetError> {
        if ctx.take_flag(META_BREAKER_ADMITTED) {
            debug!(service = %ctx.service_key, kind = %error.kind, status = error.status, "Recording breaker verdict");
            self.registry.record_error(&ctx.service_key, &error);
        }
        Ok(ErrorDisposition::Continue(error))
    }
}
