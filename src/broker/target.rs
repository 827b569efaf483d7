//! Callable targets reachable through dotted method paths.

use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;

use futures_lite::future::BoxedLocal;

use crate::broker::BrokerError;
use crate::broker::envelope::Payload;

/// Error returned by a broker method.
pub type MethodError = Box<dyn std::error::Error>;

/// Outcome of a broker method.
pub type MethodResult = Result<Payload, MethodError>;

/// Callable registered with a [`Target`].
pub type Method = Rc<dyn Fn(Payload) -> Reply>;

/// Value returned by a method invocation.
pub enum Reply {
    /// Result available immediately.
    Ready(MethodResult),
    /// Result settling at a later point.
    Deferred(BoxedLocal<MethodResult>),
}

impl Reply {
    /// Reply once `future` resolves.
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = MethodResult> + 'static,
    {
        Self::Deferred(Box::pin(future))
    }
}

impl<T, E> From<Result<T, E>> for Reply
where
    T: Into<Payload>,
    E: Into<MethodError>,
{
    fn from(result: Result<T, E>) -> Self {
        Self::Ready(result.map(Into::into).map_err(Into::into))
    }
}

/// Namespace of methods and nested child namespaces.
#[derive(Default)]
pub struct Target {
    methods: HashMap<String, Method>,
    children: HashMap<String, Target>,
}

impl Target {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method to this namespace.
    pub fn method<F, R>(mut self, name: &str, method: F) -> Self
    where
        F: Fn(Payload) -> R + 'static,
        R: Into<Reply>,
    {
        self.methods.insert(name.into(), Rc::new(move |payload| method(payload).into()));
        self
    }

    /// Add a nested namespace.
    pub fn child(mut self, name: &str, target: Target) -> Self {
        self.children.insert(name.into(), target);
        self
    }
}

/// Registry of all targets callable within one execution context.
#[derive(Default)]
pub struct TargetRegistry {
    targets: HashMap<String, Target>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target, replacing any previous target with the same name.
    pub fn register(&mut self, namespace: &str, target: Target) {
        self.targets.insert(namespace.into(), target);
    }

    /// Remove a target.
    pub fn unregister(&mut self, namespace: &str) -> Option<Target> {
        self.targets.remove(namespace)
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.targets.contains_key(namespace)
    }

    /// Resolve a dotted method path like `tiles.build`.
    pub fn resolve(&self, path: &str) -> Result<Method, BrokerError> {
        let mut segments = path.split('.');

        let (namespace, method) = match (segments.next(), segments.next_back()) {
            (Some(namespace), Some(method)) => (namespace, method),
            _ => return Err(BrokerError::NotCallable(path.into())),
        };

        let mut target = self
            .targets
            .get(namespace)
            .ok_or_else(|| BrokerError::UnknownTarget(path.into()))?;
        for segment in segments {
            target = target
                .children
                .get(segment)
                .ok_or_else(|| BrokerError::UnknownTarget(path.into()))?;
        }

        target.methods.get(method).cloned().ok_or_else(|| BrokerError::NotCallable(path.into()))
    }
}
