use std::collections::HashMap;
use std::sync::Arc;

use foldhash::fast::RandomState;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::client::Client;
use crate::context::Context;
use crate::discovery::{Discovery, SelectMode};
use crate::error::{Error, ErrorKind, Result};
use crate::option::ConnOption;

/// A multi-server client: load-balanced unicast calls and fan-out broadcast
/// over a cached pool of per-address clients.
pub struct XClient<D: Discovery> {
    discovery: D,
    mode: SelectMode,
    opt: ConnOption,
    clients: Mutex<HashMap<String, Arc<Client>, RandomState>>,
}

impl<D: Discovery + 'static> XClient<D> {
    #[must_use]
    pub fn new(discovery: D, mode: SelectMode, opt: ConnOption) -> Self {
        Self {
            discovery,
            mode,
            opt,
            clients: Mutex::new(HashMap::default()),
        }
    }

    /// Returns the cached client for `addr` if it is still usable, evicting
    /// and replacing it otherwise.
    async fn dial(&self, addr: &str) -> Result<Arc<Client>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(addr).cloned() {
            if client.is_available() {
                return Ok(client);
            }
            clients.remove(addr);
            let _ = client.close().await;
        }
        let client = Arc::new(Client::xdial(addr, self.opt.clone()).await?);
        clients.insert(addr.to_string(), client.clone());
        Ok(client)
    }

    async fn call_addr<Req, Rsp>(
        &self,
        ctx: &Context,
        addr: &str,
        service_method: &str,
        args: &Req,
    ) -> Result<Rsp>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        let client = self.dial(addr).await?;
        client.call(ctx, service_method, args).await
    }

    /// Invokes the named method on one server picked by the discovery.
    ///
    /// # Errors
    pub async fn call<Req, Rsp>(
        &self,
        ctx: &Context,
        service_method: &str,
        args: &Req,
    ) -> Result<Rsp>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        let addr = self.discovery.get(self.mode).await?;
        self.call_addr(ctx, &addr, service_method, args).await
    }

    /// Invokes the named method on every known server concurrently.
    ///
    /// The first failure cancels the remaining branches and is the reported
    /// error; otherwise the first reply to complete is returned. All
    /// branches have terminated by the time this returns.
    ///
    /// # Errors
    pub async fn broadcast<Req, Rsp>(
        self: &Arc<Self>,
        ctx: &Context,
        service_method: &str,
        args: &Req,
    ) -> Result<Rsp>
    where
        Req: Serialize + Clone + Send + Sync + 'static,
        Rsp: DeserializeOwned + Send + 'static,
    {
        let servers = self.discovery.get_all().await?;
        if servers.is_empty() {
            return Err(Error::new(
                ErrorKind::NoAvailableServers,
                "rpc discovery: no available servers".to_string(),
            ));
        }

        let ctx = ctx.child();
        let mut branches = JoinSet::new();
        for addr in servers {
            let this = self.clone();
            let ctx = ctx.clone();
            let service_method = service_method.to_string();
            let args = args.clone();
            branches.spawn(async move {
                this.call_addr::<Req, Rsp>(&ctx, &addr, &service_method, &args)
                    .await
            });
        }

        let mut first_error = None;
        let mut reply = None;
        while let Some(joined) = branches.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(Error::new(
                    ErrorKind::Shutdown,
                    format!("rpc xclient: broadcast branch failed: {e}"),
                ))
            });
            match result {
                Ok(rsp) => {
                    if reply.is_none() {
                        reply = Some(rsp);
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                        // fail fast: let the other branches observe the cancel
                        ctx.cancel();
                    }
                }
            }
        }

        match (first_error, reply) {
            (Some(e), _) => Err(e),
            (None, Some(rsp)) => Ok(rsp),
            (None, None) => Err(Error::kind(ErrorKind::NoAvailableServers)),
        }
    }

    /// Closes and evicts every cached client.
    ///
    /// # Errors
    ///
    /// Aggregates the individual close failures into one error.
    pub async fn close(&self) -> Result<()> {
        let mut clients = self.clients.lock().await;
        let mut failures = Vec::new();
        for (addr, client) in clients.drain() {
            if let Err(e) = client.close().await {
                failures.push(format!("{addr}: {e}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::Shutdown,
                format!("rpc xclient: failed to close clients: {}", failures.join("; ")),
            ))
        }
    }
}

impl<D: Discovery> std::fmt::Debug for XClient<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XClient").field("mode", &self.mode).finish()
    }
}
