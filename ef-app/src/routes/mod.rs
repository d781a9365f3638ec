mod events;
mod health;
mod sms;

pub fn router() -> axum::Router {
    axum::Router::new()
        .merge(health::router())
        .merge(events::router())
        .merge(sms::router())
}
