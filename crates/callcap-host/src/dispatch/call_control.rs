//! `callAppEvent` topic: call state queries and call control.

use std::sync::Arc;

use async_trait::async_trait;
use callcap_core::envelope::action;
use callcap_core::{AppRequest, AppResponse, MiniAppPermission};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::EventHandler;
use crate::call::{CallControl, CallControlError, CallStateProvider};
use crate::permission::PermissionGate;

pub struct CallControlHandler {
    gate: PermissionGate,
    calls: Arc<dyn CallStateProvider>,
    control: Arc<dyn CallControl>,
}

impl CallControlHandler {
    pub fn new(
        gate: PermissionGate,
        calls: Arc<dyn CallStateProvider>,
        control: Arc<dyn CallControl>,
    ) -> Self {
        Self {
            gate,
            calls,
            control,
        }
    }

    async fn call_state(&self, call_id: &str, app_id: &str) -> AppResponse {
        let required = [MiniAppPermission::GetCallState.as_str()];
        if !self.gate.check_and_record(app_id, &required, true).await {
            return AppResponse::failure();
        }
        self.calls.call_phase(call_id).map_or_else(AppResponse::failure, |phase| {
            AppResponse::success(json!({ "callId": call_id, "state": phase }))
        })
    }
}

fn control_result(call_id: &str, result: Result<(), CallControlError>) -> AppResponse {
    match result {
        Ok(()) => AppResponse::success(Value::Null),
        Err(e) => {
            warn!(call_id, error = %e, "Call control failed");
            AppResponse::failure()
        }
    }
}

#[async_trait]
impl EventHandler for CallControlHandler {
    async fn handle(
        &self,
        call_id: &str,
        app_id: &str,
        request: AppRequest,
    ) -> Option<AppResponse> {
        let response = match request.action.as_str() {
            action::GET_CALL_STATE => self.call_state(call_id, app_id).await,
            action::HANG_UP => control_result(call_id, self.control.hang_up(call_id).await),
            action::ANSWER => control_result(call_id, self.control.answer(call_id).await),
            action::SET_MUTED => match request.param_bool("muted") {
                Some(muted) => {
                    control_result(call_id, self.control.set_muted(call_id, muted).await)
                }
                None => AppResponse::failure(),
            },
            other => {
                debug!(call_id, app_id, action = other, "Unhandled call action");
                return None;
            }
        };
        Some(response)
    }
}
