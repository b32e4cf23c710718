use crate::http::{make_boxed_error_response, make_text_response};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// Serves `/health` (process is up) and `/ready` (dependencies are usable).
pub struct AdminService<F, E> {
    is_ready: F,
    _error: PhantomData<fn() -> E>,
}

impl<F, E> AdminService<F, E>
where
    F: Fn() -> bool,
{
    pub fn new(is_ready: F) -> Self {
        Self {
            is_ready,
            _error: PhantomData,
        }
    }
}

impl<F, E> Service<Request<Incoming>> for AdminService<F, E>
where
    F: Fn() -> bool,
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, E>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let response = route(req.uri().path(), (self.is_ready)());
        Box::pin(async move { Ok(response) })
    }
}

fn route<E: 'static>(path: &str, is_ready: bool) -> Response<BoxBody<Bytes, E>> {
    match path {
        "/health" => make_text_response(StatusCode::OK, "ok\n"),
        "/ready" => match is_ready {
            true => make_text_response(StatusCode::OK, "ok\n"),
            false => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
        },
        _ => make_boxed_error_response(StatusCode::NOT_FOUND),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[test]
    fn test_admin_routes() {
        assert_eq!(route::<Infallible>("/health", false).status(), StatusCode::OK);
        assert_eq!(route::<Infallible>("/ready", true).status(), StatusCode::OK);
        assert_eq!(
            route::<Infallible>("/ready", false).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            route::<Infallible>("/other", true).status(),
            StatusCode::NOT_FOUND
        );
    }
}
