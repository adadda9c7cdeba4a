//! Bearer token injection with one refresh on 401

use std::sync::Arc;

use async_trait::async_trait;
use netguard_domain::constants::HEADER_AUTHORIZATION;
use netguard_domain::{NetError, NetRequest};
use tracing::{debug, info, warn};

use super::{priority, TOKEN_REFRESH};
use crate::interceptor::chain::{
    ErrorDisposition, ErrorHandler, ErrorInterceptor, InterceptorChain, RequestHandler,
    RequestInterceptor,
};
use crate::interceptor::context::{CallContext, META_TOKEN_REFRESHED};
use crate::ports::{TokenProvider, Transport};

pub struct TokenRefreshInterceptor {
    provider: Arc<dyn TokenProvider>,
    transport: Arc<dyn Transport>,
}

impl TokenRefreshInterceptor {
    pub fn new(provider: Arc<dyn TokenProvider>, transport: Arc<dyn Transport>) -> Self {
        Self { provider, transport }
    }

    pub fn install(self: Arc<Self>, chain: &InterceptorChain) {
        chain.add_request_interceptor(RequestInterceptor::from_arc(
            TOKEN_REFRESH,
            priority::TOKEN_REQUEST,
            self.clone(),
        ));
        chain.add_error_interceptor(ErrorInterceptor::from_arc(TOKEN_REFRESH, priority::TOKEN_ERROR, self));
    }
}

fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

#[async_trait]
impl RequestHandler for TokenRefreshInterceptor {
    async fn handle(&self, request: NetRequest, _ctx: &mut CallContext) -> Result<NetRequest, NetError> {
        let token = self.provider.token().await?;
        Ok(request.with_header(HEADER_AUTHORIZATION, bearer(&token)))
    }
}

#[async_trait]
impl ErrorHandler for TokenRefreshInterceptor {
    fn can_handle(&self, error: &NetError) -> bool {
        error.status == 401
    }

    async fn handle(&self, error: NetError, ctx: &mut CallContext) -> Result<ErrorDisposition, NetError> {
        if ctx.flag(META_TOKEN_REFRESHED) {
            return Ok(ErrorDisposition::Continue(error));
        }
        ctx.set_flag(META_TOKEN_REFRESHED, true);

        let token = match self.provider.refresh().await {
            Ok(token) => token,
            Err(err) => {
                warn!(trace_id = %ctx.trace_id, error = %err, "Token refresh failed");
                return Ok(ErrorDisposition::Continue(error));
            }
        };
        info!(trace_id = %ctx.trace_id, "Token refreshed, resending request");

        let base = ctx.dispatched_request.clone().unwrap_or_else(|| ctx.original_request.clone());
        let request = base.with_header(HEADER_AUTHORIZATION, bearer(&token));
        ctx.dispatched_request = Some(request.clone());

        let limit = ctx.attempt_timeout;
        let resend = async {
            let send = self.transport.send(request);
            match limit {
                Some(limit) => tokio::time::timeout(limit, send)
                    .await
                    .unwrap_or_else(|_| Err(NetError::timeout(limit))),
                None => send.await,
            }
        };
        let result = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => {
                debug!(trace_id = %ctx.trace_id, "Resend after token refresh cancelled");
                Err(NetError::cancelled("cancelled during resend after token refresh"))
            }
            result = resend => result,
        };
        match result {
            Ok(response) => Ok(ErrorDisposition::Recovered(response)),
            Err(err) => Ok(ErrorDisposition::Continue(err)),
        }
    }
}
