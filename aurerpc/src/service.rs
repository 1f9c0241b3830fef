use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use foldhash::fast::RandomState;
use serde::{Serialize, de::DeserializeOwned};

use crate::codec::Payload;
use crate::error::Result;

type MethodFuture = Pin<Box<dyn Future<Output = Result<Payload>> + Send>>;
type MethodFn = Box<dyn Fn(Payload) -> MethodFuture + Send + Sync>;

/// One dispatchable method of a registered service.
///
/// The handler owns the whole decode-invoke-encode pipeline for a request:
/// it allocates the argument by decoding the raw payload, runs the user
/// function and encodes the reply with the connection's codec.
pub struct Method {
    name: String,
    func: MethodFn,
    arg_type: &'static str,
    reply_type: &'static str,
    num_calls: AtomicU64,
}

impl Method {
    pub(crate) async fn call(&self, argv: Payload) -> Result<Payload> {
        self.num_calls.fetch_add(1, Ordering::AcqRel);
        (self.func)(argv).await
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .finish()
    }
}

/// A named service: a set of methods a server dispatches by
/// `"Service.Method"` name.
///
/// Methods take exactly one decodable argument and return exactly one reply
/// or an error; state is whatever the registered closures capture.
///
/// ```rust,no_run
/// # use aurerpc::Service;
/// let service = Service::new("Arith")
///     .method("Sum", |args: (i64, i64)| async move { Ok(args.0 + args.1) });
/// ```
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<Method>, RandomState>,
}

impl Service {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::default(),
        }
    }

    /// Adds a method. The argument is allocated per request by decoding the
    /// wire payload; a decode failure becomes the request's error.
    #[must_use]
    pub fn method<Req, Rsp, F, Fut>(mut self, name: impl Into<String>, func: F) -> Self
    where
        Req: DeserializeOwned,
        Rsp: Serialize,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        let name = name.into();
        let handler: MethodFn = Box::new(move |argv: Payload| {
            let kind = argv.kind();
            let fut: MethodFuture = match argv.decode::<Req>() {
                Ok(req) => {
                    let call = func(req);
                    Box::pin(async move { kind.encode(&call.await?) })
                }
                Err(e) => Box::pin(std::future::ready(Err(e))),
            };
            fut
        });
        let method = Method {
            name: name.clone(),
            func: handler,
            arg_type: std::any::type_name::<Req>(),
            reply_type: std::any::type_name::<Rsp>(),
            num_calls: AtomicU64::new(0),
        };
        self.methods.insert(name, Arc::new(method));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn get(&self, method: &str) -> Option<Arc<Method>> {
        self.methods.get(method).cloned()
    }

    pub(crate) fn method_names(&self) -> impl Iterator<Item = &String> {
        self.methods.keys()
    }

    pub(crate) fn snapshot(&self) -> ServiceSnapshot {
        let mut methods: Vec<MethodSnapshot> = self
            .methods
            .values()
            .map(|m| MethodSnapshot {
                name: m.name.clone(),
                arg_type: m.arg_type.to_string(),
                reply_type: m.reply_type.to_string(),
                num_calls: m.num_calls(),
            })
            .collect();
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        ServiceSnapshot {
            name: self.name.clone(),
            methods,
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.methods.keys())
            .finish()
    }
}

/// Introspection view of one method: type names and how often it was
/// dispatched.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MethodSnapshot {
    pub name: String,
    pub arg_type: String,
    pub reply_type: String,
    pub num_calls: u64,
}

/// Introspection view of a registered service.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceSnapshot {
    pub name: String,
    pub methods: Vec<MethodSnapshot>,
}
