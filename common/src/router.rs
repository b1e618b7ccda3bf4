//! Route table shared by the provisioning portal and application endpoints.
//!
//! Portal routes are tags the provisioning controller resolves against its
//! own state; application routes are boxed handlers that own whatever they
//! need. Matching is exact on method and path, first registration order.

use crate::http::{HttpMethod, HttpRequest, HttpResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalRoute {
    WifiForm,
    SaveCredentials,
    Status,
    RedirectToWifi,
}

pub type AppHandler = Box<dyn FnMut(&HttpRequest) -> HttpResponse>;

pub enum Target {
    Portal(PortalRoute),
    App(AppHandler),
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Portal(route) => f.debug_tuple("Portal").field(route).finish(),
            Self::App(_) => f.write_str("App(..)"),
        }
    }
}

struct Route {
    method: HttpMethod,
    path: String,
    target: Target,
}

#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    fallback: Option<Target>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `target` for `method` + `path`, replacing any earlier
    /// registration of the same pair.
    pub fn route(&mut self, method: HttpMethod, path: &str, target: Target) {
        if let Some(existing) = self
            .routes
            .iter_mut()
            .find(|route| route.method == method && route.path == path)
        {
            log::debug!("router: replacing handler for {method:?} {path}");
            existing.target = target;
            return;
        }

        self.routes.push(Route {
            method,
            path: path.to_string(),
            target,
        });
    }

    pub fn get<F>(&mut self, path: &str, handler: F)
    where
        F: FnMut(&HttpRequest) -> HttpResponse + 'static,
    {
        self.route(HttpMethod::Get, path, Target::App(Box::new(handler)));
    }

    pub fn post<F>(&mut self, path: &str, handler: F)
    where
        F: FnMut(&HttpRequest) -> HttpResponse + 'static,
    {
        self.route(HttpMethod::Post, path, Target::App(Box::new(handler)));
    }

    pub fn set_fallback(&mut self, target: Target) {
        self.fallback = Some(target);
    }

    pub fn resolve(&mut self, method: HttpMethod, path: &str) -> Option<&mut Target> {
        match self
            .routes
            .iter_mut()
            .find(|route| route.method == method && route.path == path)
        {
            Some(route) => Some(&mut route.target),
            None => self.fallback.as_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_body(router: &mut Router, request: &HttpRequest) -> Option<String> {
        match router.resolve(request.method, &request.path)? {
            Target::App(handler) => Some(handler(request).body),
            Target::Portal(_) => None,
        }
    }

    #[test]
    fn dispatches_on_method_and_path() {
        let mut router = Router::new();
        router.get("/json", |_| HttpResponse::text(200, "get"));
        router.post("/json", |_| HttpResponse::text(200, "post"));

        let get = HttpRequest::new(HttpMethod::Get, "/json");
        let post = HttpRequest::new(HttpMethod::Post, "/json");
        let other = HttpRequest::new(HttpMethod::Get, "/nope");

        assert_eq!(app_body(&mut router, &get).as_deref(), Some("get"));
        assert_eq!(app_body(&mut router, &post).as_deref(), Some("post"));
        assert!(router.resolve(other.method, &other.path).is_none());
    }

    #[test]
    fn fallback_catches_unmatched_paths() {
        let mut router = Router::new();
        router.route(HttpMethod::Get, "/wifi", Target::Portal(PortalRoute::WifiForm));
        router.set_fallback(Target::Portal(PortalRoute::RedirectToWifi));

        assert!(matches!(
            router.resolve(HttpMethod::Get, "/generate_204"),
            Some(Target::Portal(PortalRoute::RedirectToWifi))
        ));
        assert!(matches!(
            router.resolve(HttpMethod::Get, "/wifi"),
            Some(Target::Portal(PortalRoute::WifiForm))
        ));
    }

    #[test]
    fn re_registering_replaces_handler() {
        let mut router = Router::new();
        router.get("/", |_| HttpResponse::text(200, "first"));
        router.get("/", |_| HttpResponse::text(200, "second"));

        let request = HttpRequest::new(HttpMethod::Get, "/");

        assert_eq!(app_body(&mut router, &request).as_deref(), Some("second"));
    }

    #[test]
    fn app_handlers_keep_their_own_state() {
        let mut router = Router::new();
        let mut hits = 0;
        router.get("/count", move |_| {
            hits += 1;
            HttpResponse::text(200, hits.to_string())
        });

        let request = HttpRequest::new(HttpMethod::Get, "/count");
        app_body(&mut router, &request);

        assert_eq!(app_body(&mut router, &request).as_deref(), Some("2"));
    }
}
