//! # Function-Call Dispatcher
//!
//! Maps named tool invocations proposed by the LLM onto Pharmacy Store
//! lookups and returns structured JSON results. Every failure mode
//! (unknown function, missing argument, unparseable identifier, lookup miss)
//! is reported back to the LLM as a tool result rather than an error that
//! could tear down the session; the conversation continues, degraded.
//!
//! ## Tools exposed to the LLM:
//! - `verify_member_id`: does this member exist?
//! - `list_member_orders`: all orders for a member
//! - `get_order_details`: medications in an order
//! - `get_order_timing`: status and expected pickup time
//! - `get_order_refills`: refills remaining per prescription
//!
//! Order-scoped tools verify the order actually belongs to the claimed
//! member before revealing anything (`verified: false` otherwise).

use crate::pharmacy::normalize::normalize_id;
use crate::pharmacy::store::PharmacyStore;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Conversational context carried across tool calls within a session.
///
/// The authenticated member and active order are convenience state for the
/// agent, never a source of truth: ownership is re-validated against the
/// store on every dispatch, not just at authentication time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentContext {
    /// Member ID the caller has verified, if any
    pub member_id: Option<String>,
    /// Order the conversation is currently about, if unambiguous
    pub order_id: Option<String>,
}

impl AgentContext {
    /// Clear both identifiers (used by the `reset` control message).
    pub fn clear(&mut self) {
        self.member_id = None;
        self.order_id = None;
    }
}

/// Dispatches LLM tool calls against the read-only store.
pub struct FunctionDispatcher {
    store: Arc<PharmacyStore>,
}

/// Tool declarations sent to the LLM with every chat completion request.
pub fn tool_declarations() -> Value {
    json!([
        {
            "type": "function",
            "function": {
                "name": "verify_member_id",
                "description": "Verify if a member ID exists in the system",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "member_id": {
                            "type": "string",
                            "description": "The member ID to verify (e.g., M1001)"
                        }
                    },
                    "required": ["member_id"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "list_member_orders",
                "description": "List all orders for a member. Use when asked 'what orders do I have?'",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "member_id": { "type": "string", "description": "The member ID" }
                    },
                    "required": ["member_id"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "get_order_details",
                "description": "Get medication details for an order. Use when asked 'what medication?'",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "order_id": { "type": "string", "description": "The order ID" },
                        "member_id": { "type": "string", "description": "The member ID" }
                    },
                    "required": ["order_id", "member_id"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "get_order_timing",
                "description": "Get timing info for an order. Use when asked 'when will it be ready?'",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "order_id": { "type": "string", "description": "The order ID" },
                        "member_id": { "type": "string", "description": "The member ID" }
                    },
                    "required": ["order_id", "member_id"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "get_order_refills",
                "description": "Get refill info for an order. Use when asked 'do I have refills?'",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "order_id": { "type": "string", "description": "The order ID" },
                        "member_id": { "type": "string", "description": "The member ID" }
                    },
                    "required": ["order_id", "member_id"]
                }
            }
        }
    ])
}

impl FunctionDispatcher {
    pub fn new(store: Arc<PharmacyStore>) -> Self {
        Self { store }
    }

    /// Execute a named tool call with JSON-shaped arguments.
    ///
    /// Always returns a JSON value suitable for feeding back to the LLM as a
    /// tool result; failures come back as `{"error": <reason>}`.
    pub fn dispatch(&self, name: &str, args: &Value, ctx: &mut AgentContext) -> Value {
        debug!(function = name, args = %args, "Dispatching tool call");

        // Re-validate the active order against the authenticated member on
        // every call; a stale order from a previous member must not leak.
        self.revalidate_context(ctx);

        let result = match name {
            "verify_member_id" => self.verify_member_id(args, ctx),
            "list_member_orders" => self.list_member_orders(args, ctx),
            "get_order_details" => self.order_lookup(args, OrderFacet::Details),
            "get_order_timing" => self.order_lookup(args, OrderFacet::Timing),
            "get_order_refills" => self.order_lookup(args, OrderFacet::Refills),
            other => {
                warn!(function = other, "LLM requested unknown function");
                json!({ "error": format!("Unknown function: {}", other) })
            }
        };

        debug!(function = name, result = %result, "Tool call result");
        result
    }

    fn revalidate_context(&self, ctx: &mut AgentContext) {
        let valid = match (&ctx.member_id, &ctx.order_id) {
            (Some(member_id), Some(order_id)) => self
                .store
                .get_order(order_id)
                .map(|o| normalize_id(&o.member_id).ok() == Some(member_id.clone()))
                .unwrap_or(false),
            (None, Some(_)) => false,
            _ => true,
        };

        if !valid {
            warn!("Active order does not belong to authenticated member, clearing");
            ctx.order_id = None;
        }
    }

    fn verify_member_id(&self, args: &Value, ctx: &mut AgentContext) -> Value {
        let member_id = match normalized_arg(args, "member_id") {
            Ok(id) => id,
            Err(e) => return e,
        };

        match self.store.find_member(&member_id) {
            Some(member) => {
                ctx.member_id = Some(member_id.clone());
                json!({ "found": true, "member_id": member_id, "name": member.name })
            }
            None => json!({ "found": false, "member_id": member_id }),
        }
    }

    fn list_member_orders(&self, args: &Value, ctx: &mut AgentContext) -> Value {
        let member_id = match normalized_arg(args, "member_id") {
            Ok(id) => id,
            Err(e) => return e,
        };

        let orders = self.store.list_orders(&member_id);
        if orders.is_empty() {
            return json!({ "found": false, "member_id": member_id });
        }

        // A single order becomes the implicit subject of follow-up questions
        if orders.len() == 1 {
            if let Ok(order_id) = normalize_id(&orders[0].order_id) {
                ctx.order_id = Some(order_id);
            }
        }

        json!({
            "found": true,
            "member_id": member_id,
            "order_count": orders.len(),
            "orders": orders.iter().map(|o| json!({
                "order_id": o.order_id,
                "status": o.status,
            })).collect::<Vec<_>>()
        })
    }

    fn order_lookup(&self, args: &Value, facet: OrderFacet) -> Value {
        let order_id = match normalized_arg(args, "order_id") {
            Ok(id) => id,
            Err(e) => return e,
        };
        let member_id = match normalized_arg(args, "member_id") {
            Ok(id) => id,
            Err(e) => return e,
        };

        let order = match self.store.get_order(&order_id) {
            Some(order) => order,
            None => return json!({ "found": false, "verified": false }),
        };

        let owner = normalize_id(&order.member_id).unwrap_or_default();
        if owner != member_id {
            // Order exists but belongs to someone else; reveal nothing
            return json!({ "found": true, "verified": false });
        }

        match facet {
            OrderFacet::Details => json!({
                "found": true,
                "verified": true,
                "order_id": order.order_id,
                "prescriptions": order.prescriptions,
            }),
            OrderFacet::Timing => json!({
                "found": true,
                "verified": true,
                "order_id": order.order_id,
                "status": order.status,
                "expected_pickup_time": order.expected_pickup_time,
            }),
            OrderFacet::Refills => json!({
                "found": true,
                "verified": true,
                "order_id": order.order_id,
                "refills": order.prescriptions.iter().map(|rx| json!({
                    "medication": rx.name,
                    "rx_id": rx.rx_id,
                    "refills_remaining": rx.refills_remaining,
                })).collect::<Vec<_>>()
            }),
        }
    }
}

/// Which view of an order a tool call wants.
enum OrderFacet {
    Details,
    Timing,
    Refills,
}

/// Pull a required string argument and normalize it as an identifier.
/// Both failure modes come back as ready-to-send tool error objects.
fn normalized_arg(args: &Value, field: &str) -> Result<String, Value> {
    let raw = args
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| json!({ "error": format!("Missing required argument: {}", field) }))?;

    normalize_id(raw).map_err(|e| json!({ "error": e.to_string() }))
}
