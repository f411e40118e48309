//! Ordered, named pass lists.
//!
//! # Responsibilities
//! - Keep passes in execution order per traffic kind
//! - Look passes up by name (first match wins)
//! - Splice new passes before/after a named pass
//!
//! # Design Decisions
//! - A failed splice leaves the list untouched
//! - Live pipelines sit behind `ArcSwap`: dispatch takes a snapshot, mutation
//!   publishes a modified copy. Mutation is meant for setup time.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::PipelineError;
use crate::pipeline::pass::{ResponsePassRef, WebPassRef, WsPassRef};

/// Something that can be found in a pipeline by name.
pub trait Named {
    fn name(&self) -> &str;
}

impl<T: Named + ?Sized> Named for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Traffic kind a pipeline serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Plain HTTP request/response.
    Web,
    /// WebSocket upgrade.
    Ws,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Web => "web",
            Kind::Ws => "ws",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web" => Ok(Kind::Web),
            "ws" => Ok(Kind::Ws),
            other => Err(PipelineError::InvalidKind(other.to_string())),
        }
    }
}

/// An ordered list of named passes.
#[derive(Clone)]
pub struct Pipeline<P> {
    passes: Vec<P>,
}

impl<P> Default for Pipeline<P> {
    fn default() -> Self {
        Self { passes: Vec::new() }
    }
}

impl<P: Named> Pipeline<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_passes(passes: Vec<P>) -> Self {
        Self { passes }
    }

    /// Append a pass at the end.
    pub fn register(&mut self, pass: P) {
        self.passes.push(pass);
    }

    /// Position of the first pass called `name`.
    pub fn position(&self, name: &str) -> Result<usize, PipelineError> {
        self.passes
            .iter()
            .position(|p| p.name() == name)
            .ok_or_else(|| PipelineError::NoSuchPass(name.to_string()))
    }

    /// Insert `pass` immediately before the pass called `name`.
    pub fn insert_before(&mut self, name: &str, pass: P) -> Result<(), PipelineError> {
        let index = self.position(name)?;
        self.passes.insert(index, pass);
        Ok(())
    }

    /// Insert `pass` immediately after the pass called `name`.
    pub fn insert_after(&mut self, name: &str, pass: P) -> Result<(), PipelineError> {
        let index = self.position(name)?;
        self.passes.insert(index + 1, pass);
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.passes.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, P> {
        self.passes.iter()
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}

/// A pass of either kind, as accepted by the registry's mutation API.
#[derive(Clone)]
pub enum Pass {
    Web(WebPassRef),
    Ws(WsPassRef),
}

impl Pass {
    pub fn kind(&self) -> Kind {
        match self {
            Pass::Web(_) => Kind::Web,
            Pass::Ws(_) => Kind::Ws,
        }
    }
}

impl From<WebPassRef> for Pass {
    fn from(pass: WebPassRef) -> Self {
        Pass::Web(pass)
    }
}

impl From<WsPassRef> for Pass {
    fn from(pass: WsPassRef) -> Self {
        Pass::Ws(pass)
    }
}

enum Splice {
    Append,
    Before,
    After,
}

/// The live pipelines of one proxy instance.
pub struct PassRegistry {
    web: ArcSwap<Pipeline<WebPassRef>>,
    ws: ArcSwap<Pipeline<WsPassRef>>,
    response: ArcSwap<Pipeline<ResponsePassRef>>,
}

impl PassRegistry {
    pub fn new(
        web: Pipeline<WebPassRef>,
        ws: Pipeline<WsPassRef>,
        response: Pipeline<ResponsePassRef>,
    ) -> Self {
        Self {
            web: ArcSwap::from_pointee(web),
            ws: ArcSwap::from_pointee(ws),
            response: ArcSwap::from_pointee(response),
        }
    }

    /// Snapshot of the plain pipeline.
    pub fn web(&self) -> Arc<Pipeline<WebPassRef>> {
        self.web.load_full()
    }

    /// Snapshot of the upgrade pipeline.
    pub fn ws(&self) -> Arc<Pipeline<WsPassRef>> {
        self.ws.load_full()
    }

    /// Snapshot of the response rewrite chain.
    pub fn response(&self) -> Arc<Pipeline<ResponsePassRef>> {
        self.response.load_full()
    }

    /// Append `pass` to the pipeline of `kind`.
    pub fn register(&self, kind: Kind, pass: Pass) -> Result<(), PipelineError> {
        self.splice(kind, Splice::Append, "", pass)
    }

    pub fn insert_before(&self, kind: Kind, name: &str, pass: Pass) -> Result<(), PipelineError> {
        self.splice(kind, Splice::Before, name, pass)
    }

    pub fn insert_after(&self, kind: Kind, name: &str, pass: Pass) -> Result<(), PipelineError> {
        self.splice(kind, Splice::After, name, pass)
    }

    pub fn insert_response_before(&self, name: &str, pass: ResponsePassRef) -> Result<(), PipelineError> {
        modify(&self.response, |p| p.insert_before(name, pass))
    }

    pub fn insert_response_after(&self, name: &str, pass: ResponsePassRef) -> Result<(), PipelineError> {
        modify(&self.response, |p| p.insert_after(name, pass))
    }

    fn splice(&self, kind: Kind, at: Splice, name: &str, pass: Pass) -> Result<(), PipelineError> {
        match (kind, pass) {
            (Kind::Web, Pass::Web(pass)) => modify(&self.web, |p| apply(p, at, name, pass)),
            (Kind::Ws, Pass::Ws(pass)) => modify(&self.ws, |p| apply(p, at, name, pass)),
            (kind, pass) => Err(PipelineError::KindMismatch {
                pipeline: kind.as_str(),
                pass: pass.kind().as_str(),
            }),
        }
    }
}

fn apply<P: Named>(pipeline: &mut Pipeline<P>, at: Splice, name: &str, pass: P) -> Result<(), PipelineError> {
    match at {
        Splice::Append => {
            pipeline.register(pass);
            Ok(())
        }
        Splice::Before => pipeline.insert_before(name, pass),
        Splice::After => pipeline.insert_after(name, pass),
    }
}

fn modify<P, F>(cell: &ArcSwap<Pipeline<P>>, f: F) -> Result<(), PipelineError>
where
    P: Named + Clone,
    F: FnOnce(&mut Pipeline<P>) -> Result<(), PipelineError>,
{
    let mut next = Pipeline::clone(&cell.load());
    f(&mut next)?;
    cell.store(Arc::new(next));
    Ok(())
}
