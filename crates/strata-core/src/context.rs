//! Per-connection context shared by a layer stack.

use std::sync::Arc;

use crate::connection::ConnectionRef;
use crate::layer::LayerKind;
use crate::options::Options;

/// The client, the current server target, the options and the kinds of the
/// layers stacked above the holder (innermost last).
#[derive(Debug, Clone)]
pub struct Context {
    pub client: ConnectionRef,
    pub server: ConnectionRef,
    pub options: Arc<Options>,
    layers: Vec<LayerKind>,
}

impl Context {
    /// A fresh context for a newly accepted client.
    pub fn new(client: ConnectionRef, options: Arc<Options>) -> Self {
        Self {
            client,
            server: ConnectionRef::server(None),
            options,
            layers: Vec::new(),
        }
    }

    /// A derived context that may diverge on its server target.
    pub fn fork(&self) -> Self {
        self.clone()
    }

    pub fn with_server(mut self, server: ConnectionRef) -> Self {
        self.server = server;
        self
    }

    /// The context a layer of `kind` hands to its children.
    pub fn enter(&self, kind: LayerKind) -> Self {
        let mut ctx = self.clone();
        ctx.layers.push(kind);
        ctx
    }

    /// Kinds of all layers above the holder, outermost first.
    pub fn layers(&self) -> &[LayerKind] {
        &self.layers
    }

    /// Kind of the innermost layer above the holder.
    pub fn parent_kind(&self) -> Option<LayerKind> {
        self.layers.last().copied()
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_records_ancestors() {
        let ctx = Context::new(ConnectionRef::client(None, None), Arc::new(Options::default()));
        assert_eq!(ctx.parent_kind(), None);

        let child = ctx.enter(LayerKind::ServerTls).enter(LayerKind::ClientTls);
        assert_eq!(child.layers(), &[LayerKind::ServerTls, LayerKind::ClientTls]);
        assert_eq!(child.parent_kind(), Some(LayerKind::ClientTls));
        assert_eq!(ctx.depth(), 0);
    }

    #[test]
    fn fork_shares_client_and_diverges_on_server() {
        let ctx = Context::new(ConnectionRef::client(None, None), Arc::new(Options::default()));
        let forked = ctx.fork().with_server(ConnectionRef::server(None));
        assert_eq!(forked.client, ctx.client);
        assert_ne!(forked.server, ctx.server);
        assert!(Arc::ptr_eq(&forked.options, &ctx.options));
    }
}
