pub mod error;
pub mod proxy;
pub mod target;

pub use error::ApiError;
pub use target::{TargetError, TargetRequest};

/// Every method is served from the same `/<remote-url>` pattern. HEAD is
/// answered by the GET route.
pub fn routes() -> Vec<rocket::Route> {
    routes![
        proxy::proxy_get,
        proxy::proxy_options,
        proxy::proxy_post,
        proxy::proxy_put,
        proxy::proxy_patch,
        proxy::proxy_delete,
    ]
}
