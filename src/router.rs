//! Radix-tree route table.
//!
//! One tree per HTTP method, O(path-length) lookup. Built during startup and
//! read-only afterwards, so lookups take no locks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use http::Method;
use matchit::Router as MatchitRouter;

use crate::error::Error;
use crate::handler::BoxedHandler;

/// A registered route: its full pattern and its composed handler chain.
pub(crate) struct Route {
    pub(crate) pattern: String,
    pub(crate) handler: BoxedHandler,
}

#[derive(Default)]
pub(crate) struct Routes {
    trees: HashMap<Method, MatchitRouter<Arc<Route>>>,
    registered: HashSet<(Method, String)>,
}

impl Routes {
    pub(crate) fn insert(&mut self, method: Method, pattern: String, handler: BoxedHandler) -> Result<(), Error> {
        if self.registered.contains(&(method.clone(), pattern.clone())) {
            return Err(Error::DuplicateRoute { method, path: pattern });
        }

        let route = Arc::new(Route { pattern: pattern.clone(), handler });
        self.trees
            .entry(method.clone())
            .or_default()
            .insert(pattern.clone(), route)
            .map_err(|source| Error::InvalidRoute { path: pattern.clone(), source })?;

        self.registered.insert((method, pattern));
        Ok(())
    }

    pub(crate) fn lookup(&self, method: &Method, path: &str) -> Option<(Arc<Route>, HashMap<String, String>)> {
        let tree = self.trees.get(method)?;
        let matched = tree.at(path).ok()?;
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some((Arc::clone(matched.value), params))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }
}

/// Join a route group and a path with exactly one `/` between them.
///
/// `("/api/v1", "/hello")` → `/api/v1/hello`, `("", "users")` → `/users`.
pub(crate) fn join(group: &str, path: &str) -> String {
    let group = group.trim_matches('/');
    let path = path.trim_start_matches('/');

    let mut out = String::with_capacity(group.len() + path.len() + 2);
    if !group.is_empty() {
        out.push('/');
        out.push_str(group);
        if path.is_empty() {
            return out;
        }
    }
    out.push('/');
    out.push_str(path);
    out
}
