//! Route registration

pub mod admin;
pub mod billing;
pub mod campaigns;
pub mod entitlements;
pub mod webhooks;

use axum::middleware;
use axum::routing::{get, patch, post, put};
use axum::Router;

use crate::auth::{require_admin, require_auth};
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    // Webhook and health endpoints authenticate themselves (signature /
    // nothing), never via bearer tokens.
    let public = Router::new()
        .route("/health", get(health))
        .route("/webhooks/razorpay", post(webhooks::razorpay_webhook));

    let authed = Router::new()
        .route("/entitlements", get(entitlements::get_entitlements))
        .route(
            "/entitlements/limits/{key}",
            get(entitlements::get_effective_limit),
        )
        .route("/billing/trial", post(billing::start_trial))
        .route("/billing/orders", post(billing::record_order))
        .route("/billing/invoices", get(billing::list_invoices))
        .route(
            "/campaigns/{id}/ai-optimization",
            post(campaigns::enable_ai_optimization)
                .delete(campaigns::disable_ai_optimization),
        )
        .route(
            "/campaigns/{id}/ai-optimization/check",
            get(campaigns::check_ai_optimization),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ));

    let admin_routes = Router::new()
        .route("/admin/users/{id}/overrides", get(admin::list_overrides))
        .route(
            "/admin/users/{id}/overrides/{key}",
            put(admin::upsert_override).delete(admin::delete_override),
        )
        .route(
            "/admin/users/{id}/subscription",
            post(admin::assign_subscription),
        )
        .route(
            "/admin/users/{id}/subscription/cancel",
            post(admin::cancel_subscription),
        )
        .route("/admin/slots/{id}/extend", post(admin::extend_slot))
        .route("/admin/slots/{id}/expire", post(admin::expire_slot))
        .route("/admin/slots/{id}", patch(admin::adjust_slot))
        .route(
            "/admin/settings",
            get(admin::get_settings).put(admin::update_settings),
        )
        .route("/admin/invariants", get(admin::run_invariants))
        .route("/admin/invariants/{name}", get(admin::run_invariant))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin,
        ));

    public
        .merge(authed)
        .merge(admin_routes)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
