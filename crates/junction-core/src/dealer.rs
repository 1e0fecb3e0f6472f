//! Remote procedure call routing for one realm.
//!
//! Each procedure has exactly one callee. A CALL becomes an INVOCATION whose
//! id is drawn from the callee's request counter; the dealer remembers which
//! caller and request it belongs to until the callee answers with YIELD or
//! ERROR.
//!
//! Two locks guard the dealer: one for the registration tables and one for
//! pending invocations. [`Dealer::call`] takes both, always registrations
//! first.

use crate::session::{reply, SessionHandle, SessionTable};
use junction_protocol::messages::{
    Call, CallResult, Error as ErrorMessage, Invocation, Register, Registered, Unregister,
    Unregistered, Yield,
};
use junction_protocol::{reason, Dict, Id, Message, MessageType, Uri};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, trace, warn};

#[derive(Debug)]
struct Procedure {
    uri: Uri,
    callee: Id,
}

#[derive(Debug, Default)]
struct Registrations {
    /// procedure -> registration
    procedures: HashMap<Uri, Id>,
    /// registration -> procedure and owning callee
    registrations: HashMap<Id, Procedure>,
}

/// Where to deliver the outcome of an invocation.
#[derive(Debug, Clone, Copy)]
struct PendingInvocation {
    caller: Id,
    /// The caller's CALL request id.
    request: Id,
}

/// Invocations awaiting an answer, keyed by (callee session, invocation id).
type Invocations = HashMap<(Id, Id), PendingInvocation>;

/// Routes calls to callees and their answers back to callers.
#[derive(Debug)]
pub struct Dealer {
    registrations: Mutex<Registrations>,
    invocations: Mutex<Invocations>,
    sessions: Arc<SessionTable>,
}

impl Dealer {
    /// Create a dealer resolving callers and callees through `sessions`.
    #[must_use]
    pub fn new(sessions: Arc<SessionTable>) -> Self {
        Self {
            registrations: Mutex::new(Registrations::default()),
            invocations: Mutex::new(Invocations::new()),
            sessions,
        }
    }

    /// Register a procedure for a callee.
    pub async fn register(&self, callee: &SessionHandle, msg: Register) {
        let response = {
            let mut tables = self.registrations.lock().await;
            if tables.procedures.contains_key(&msg.procedure) {
                debug!(
                    session = callee.id(),
                    procedure = %msg.procedure,
                    "Procedure already registered"
                );
                Message::error(
                    MessageType::Register,
                    msg.request,
                    reason::PROCEDURE_ALREADY_EXISTS,
                )
            } else {
                let registration = crate::id::new_id();
                tables.procedures.insert(msg.procedure.clone(), registration);
                tables.registrations.insert(
                    registration,
                    Procedure {
                        uri: msg.procedure.clone(),
                        callee: callee.id(),
                    },
                );
                debug!(
                    session = callee.id(),
                    procedure = %msg.procedure,
                    registration,
                    "Registered"
                );
                Message::Registered(Registered {
                    request: msg.request,
                    registration,
                })
            }
        };
        reply(callee, response).await;
    }

    /// Remove a registration.
    pub async fn unregister(&self, callee: &SessionHandle, msg: Unregister) {
        let removed = {
            let mut tables = self.registrations.lock().await;
            let procedure = tables.registrations.remove(&msg.registration);
            if let Some(procedure) = &procedure {
                let consistent = tables.procedures.remove(&procedure.uri) == Some(msg.registration);
                if !consistent {
                    error!(
                        registration = msg.registration,
                        procedure = %procedure.uri,
                        "Registration missing from procedure table"
                    );
                }
                debug_assert!(consistent, "dealer indices out of sync");
            }
            procedure
        };

        let response = match removed {
            Some(procedure) => {
                debug!(
                    session = callee.id(),
                    procedure = %procedure.uri,
                    registration = msg.registration,
                    "Unregistered"
                );
                Message::Unregistered(Unregistered { request: msg.request })
            }
            None => Message::error(
                MessageType::Unregister,
                msg.request,
                reason::NO_SUCH_REGISTRATION,
            ),
        };
        reply(callee, response).await;
    }

    /// Forward a call to the procedure's callee.
    ///
    /// Returns as soon as the invocation is queued; the result arrives
    /// later through [`Dealer::yield_result`] or [`Dealer::error`].
    pub async fn call(&self, caller: &SessionHandle, msg: Call) {
        let dispatch = {
            let tables = self.registrations.lock().await;
            let target = tables.procedures.get(&msg.procedure).and_then(|&registration| {
                let procedure = tables.registrations.get(&registration);
                if procedure.is_none() {
                    error!(
                        registration,
                        procedure = %msg.procedure,
                        "Procedure points at a missing registration"
                    );
                }
                debug_assert!(procedure.is_some(), "dealer indices out of sync");
                procedure.map(|p| (registration, p.callee))
            });

            match target.and_then(|(registration, callee)| {
                self.sessions
                    .get(&callee)
                    .map(|s| (registration, s.clone()))
            }) {
                Some((registration, callee)) => {
                    let invocation = callee.next_request_id();
                    self.invocations.lock().await.insert(
                        (callee.id(), invocation),
                        PendingInvocation {
                            caller: caller.id(),
                            request: msg.request,
                        },
                    );
                    Some((registration, callee, invocation))
                }
                None => None,
            }
        };

        let Some((registration, callee, invocation)) = dispatch else {
            debug!(
                session = caller.id(),
                procedure = %msg.procedure,
                "No such procedure"
            );
            let error = Message::error(MessageType::Call, msg.request, reason::NO_SUCH_PROCEDURE);
            reply(caller, error).await;
            return;
        };

        trace!(
            caller = caller.id(),
            callee = callee.id(),
            procedure = %msg.procedure,
            invocation,
            "Invoking"
        );

        let message = Message::Invocation(Invocation {
            request: invocation,
            registration,
            details: Dict::new(),
            arguments: msg.arguments,
            arguments_kw: msg.arguments_kw,
        });
        if callee.send(message).await.is_err() {
            // Only cancel if callee teardown has not done so already.
            let pending = self
                .invocations
                .lock()
                .await
                .remove(&(callee.id(), invocation));
            if pending.is_some() {
                let error = Message::error(MessageType::Call, msg.request, reason::CANCELED);
                reply(caller, error).await;
            }
        }
    }

    /// Deliver a callee's YIELD to the original caller as a RESULT.
    ///
    /// A yield for an unknown invocation is logged and dropped.
    pub async fn yield_result(&self, callee: &SessionHandle, msg: Yield) {
        let Some(pending) = self.take_pending(callee, msg.request).await else {
            return;
        };
        let result = Message::Result(CallResult {
            request: pending.request,
            details: Dict::new(),
            arguments: msg.arguments,
            arguments_kw: msg.arguments_kw,
        });
        self.deliver(pending.caller, result);
    }

    /// Deliver a callee's ERROR for an invocation to the original caller.
    ///
    /// An error for an unknown invocation is logged and dropped.
    pub async fn error(&self, callee: &SessionHandle, msg: ErrorMessage) {
        let Some(pending) = self.take_pending(callee, msg.request).await else {
            return;
        };
        let error = Message::Error(ErrorMessage {
            request_type: MessageType::Call,
            request: pending.request,
            details: msg.details,
            error: msg.error,
            arguments: msg.arguments,
            arguments_kw: msg.arguments_kw,
        });
        self.deliver(pending.caller, error);
    }

    /// Drop a departing session's registrations and invocations.
    ///
    /// Callers still waiting on that session as callee receive
    /// `wamp.error.canceled`.
    pub async fn remove_session(&self, session: Id) {
        let registrations = {
            let mut tables = self.registrations.lock().await;
            let owned: Vec<Id> = tables
                .registrations
                .iter()
                .filter(|(_, procedure)| procedure.callee == session)
                .map(|(&registration, _)| registration)
                .collect();
            for registration in &owned {
                if let Some(procedure) = tables.registrations.remove(registration) {
                    tables.procedures.remove(&procedure.uri);
                }
            }
            owned.len()
        };

        let mut canceled = Vec::new();
        self.invocations
            .lock()
            .await
            .retain(|&(callee, _), pending| {
                if callee == session {
                    canceled.push(*pending);
                    false
                } else {
                    pending.caller != session
                }
            });

        if registrations > 0 || !canceled.is_empty() {
            debug!(
                session,
                registrations,
                canceled = canceled.len(),
                "Removed session from dealer"
            );
        }

        for pending in canceled {
            let error = Message::error(MessageType::Call, pending.request, reason::CANCELED);
            self.deliver(pending.caller, error);
        }
    }

    /// Number of registered procedures.
    pub async fn registration_count(&self) -> usize {
        self.registrations.lock().await.registrations.len()
    }

    /// Number of invocations awaiting an answer.
    pub async fn pending_invocation_count(&self) -> usize {
        self.invocations.lock().await.len()
    }

    async fn take_pending(&self, callee: &SessionHandle, invocation: Id) -> Option<PendingInvocation> {
        let pending = self
            .invocations
            .lock()
            .await
            .remove(&(callee.id(), invocation));
        if pending.is_none() {
            warn!(
                session = callee.id(),
                invocation,
                "Answer for unknown invocation"
            );
        }
        pending
    }

    /// Hand a message to the caller on its own task so a slow caller
    /// cannot hold up the dealer.
    fn deliver(&self, caller_id: Id, message: Message) {
        let Some(caller) = self.sessions.get(&caller_id).map(|s| s.clone()) else {
            debug!(session = caller_id, "Caller left before its call completed");
            return;
        };
        tokio::spawn(async move {
            reply(&caller, message).await;
        });
    }
}
