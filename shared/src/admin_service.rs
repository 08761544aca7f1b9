//! Liveness and readiness probes served on the admin listener.

use crate::http::{make_boxed_error_response, make_boxed_text_response};
use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

pub struct AdminService<F, E> {
    service_name: &'static str,
    is_ready: F,
    _error: PhantomData<fn() -> E>,
}

impl<F, E> AdminService<F, E>
where
    F: Fn() -> bool,
{
    pub fn new(service_name: &'static str, is_ready: F) -> Self {
        Self {
            service_name,
            is_ready,
            _error: PhantomData,
        }
    }

    fn respond(&self, path: &str) -> Response<BoxBody<Bytes, E>>
    where
        E: 'static,
    {
        match path {
            "/health" => make_boxed_text_response(StatusCode::OK, "ok"),
            "/ready" if (self.is_ready)() => make_boxed_text_response(StatusCode::OK, "ok"),
            "/ready" => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
            "/version" => make_boxed_text_response(
                StatusCode::OK,
                &format!("{} {}", self.service_name, env!("CARGO_PKG_VERSION")),
            ),
            _ => make_boxed_error_response(StatusCode::NOT_FOUND),
        }
    }
}

impl<F, E, B> Service<Request<B>> for AdminService<F, E>
where
    F: Fn() -> bool + Send + Sync + 'static,
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, E>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let res = self.respond(req.uri().path());
        Box::pin(async move { Ok(res) })
    }
}
