use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ember_core::pool::TaskHandle;
use ember_core::{ComputeBackend, Error, Init, Parameter, Result, Session, Shape, Tensor};
use tracing::trace;

// Module — the layer-facing face of the autograd graph
//
// Every layer owns a ModuleCore: its session handle, its backend (chosen
// once, at construction), its parameter cache, its two argument stores,
// and its lazily shape-registered output tensor.
//
// Argument staging is asynchronous: `stage_forward_arg` /
// `stage_backward_arg` submit the insertion to the session's worker pool
// and hand back an ArgTicket. The argument stores can only be read
// through `join`, which consumes every ticket — so a dispatch path
// cannot observe a half-registered argument map; the handles make the
// "staged before run" ordering a type-level obligation instead of a
// convention.

/// Proof that one argument registration was queued. Must be consumed by
/// [`ModuleCore::join`] before the argument stores are read.
#[must_use = "registration tickets must be joined before dispatch"]
pub struct ArgTicket(TaskHandle<()>);

#[derive(Clone, Default, Debug)]
struct ArgStore {
    map: Arc<Mutex<HashMap<&'static str, Tensor>>>,
}

impl ArgStore {
    fn stage(&self, session: &Session, name: &'static str, tensor: &Tensor) -> ArgTicket {
        let map = Arc::clone(&self.map);
        let tensor = tensor.clone();
        ArgTicket(session.submit(move || {
            map.lock()
                .map_err(|_| Error::msg("argument store poisoned"))?
                .insert(name, tensor);
            Ok(())
        }))
    }

    fn get(&self, name: &'static str) -> Result<Tensor> {
        self.map
            .lock()
            .map_err(|_| Error::msg("argument store poisoned"))?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::msg(format!("argument `{name}` was never staged")))
    }
}

/// State shared by every layer implementation.
#[derive(Debug)]
pub struct ModuleCore {
    name: String,
    session: Session,
    backend: ComputeBackend,
    params: Mutex<Vec<Parameter>>,
    forward_args: ArgStore,
    backward_args: ArgStore,
    y: Mutex<Option<Tensor>>,
}

impl ModuleCore {
    /// Register a module of `type_name` with the session and pick its
    /// backend once.
    pub fn new(session: &Session, backend: &ComputeBackend, type_name: &str) -> Self {
        ModuleCore {
            name: session.register_module(type_name),
            session: session.clone(),
            backend: backend.clone(),
            params: Mutex::new(Vec::new()),
            forward_args: ArgStore::default(),
            backward_args: ArgStore::default(),
            y: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn backend(&self) -> &ComputeBackend {
        &self.backend
    }

    //  Argument staging

    /// Queue `tensor` for the forward argument store under `name`.
    pub fn stage_forward_arg(&self, name: &'static str, tensor: &Tensor) -> ArgTicket {
        trace!(module = %self.name, arg = name, "stage forward arg");
        self.forward_args.stage(&self.session, name, tensor)
    }

    /// Queue `tensor` for the backward argument store under `name`.
    pub fn stage_backward_arg(&self, name: &'static str, tensor: &Tensor) -> ArgTicket {
        trace!(module = %self.name, arg = name, "stage backward arg");
        self.backward_args.stage(&self.session, name, tensor)
    }

    /// Consume every registration ticket, blocking until all queued
    /// insertions have landed. Dispatch paths call this before reading
    /// either argument store.
    pub fn join(&self, tickets: Vec<ArgTicket>) -> Result<()> {
        for ticket in tickets {
            ticket.0.wait()?;
        }
        Ok(())
    }

    /// Read a joined forward argument.
    pub fn forward_arg(&self, name: &'static str) -> Result<Tensor> {
        self.forward_args.get(name)
    }

    /// Read a joined backward argument.
    pub fn backward_arg(&self, name: &'static str) -> Result<Tensor> {
        self.backward_args.get(name)
    }

    //  Parameter registration (the sole source of truth for parameters())

    /// Construct a weight parameter from an initialization rule and
    /// record it in the parameter cache.
    pub fn register_weight(&self, init: &Init, shape: impl Into<Shape>) -> Result<Parameter> {
        let p = Parameter::new(init, shape, false, false)?;
        self.push_param(p.clone())?;
        Ok(p)
    }

    /// Construct a bias parameter — or, when `use_bias` is false, a
    /// 1-element placeholder so layer code can branch uniformly on
    /// `use_bias` without holding an optional parameter.
    pub fn register_bias(
        &self,
        use_bias: bool,
        init: &Init,
        shape: impl Into<Shape>,
    ) -> Result<Parameter> {
        let p = if use_bias {
            Parameter::new(init, shape, false, true)?
        } else {
            Parameter::placeholder()?
        };
        self.push_param(p.clone())?;
        Ok(p)
    }

    fn push_param(&self, p: Parameter) -> Result<()> {
        self.params
            .lock()
            .map_err(|_| Error::msg("parameter cache poisoned"))?
            .push(p);
        Ok(())
    }

    /// The directly owned parameters, in registration order.
    pub fn parameters(&self) -> Vec<Parameter> {
        self.params
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    //  Output registration

    /// Lazily create the output tensor on first forward; afterwards the
    /// shape is fixed until `reset_output`.
    pub fn register_output(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        let mut y = self.y.lock().map_err(|_| Error::msg("output slot poisoned"))?;
        match &*y {
            Some(existing) => {
                if existing.shape() != shape {
                    return Err(Error::ShapeMismatch {
                        expected: existing.shape(),
                        got: shape,
                    });
                }
                Ok(existing.clone())
            }
            None => {
                let t = Tensor::zeros(shape);
                *y = Some(t.clone());
                Ok(t)
            }
        }
    }

    /// The registered output tensor.
    pub fn output(&self) -> Result<Tensor> {
        self.y
            .lock()
            .map_err(|_| Error::msg("output slot poisoned"))?
            .clone()
            .ok_or_else(|| Error::msg(format!("{}: forward has not run yet", self.name)))
    }

    /// Forget the registered output so the next forward re-registers the
    /// shape (e.g. for a new batch size).
    pub fn reset_output(&self) -> Result<()> {
        *self.y.lock().map_err(|_| Error::msg("output slot poisoned"))? = None;
        Ok(())
    }

    /// Append this application to the session graph.
    pub fn record_step(&self, inputs: &[&Tensor], output: &Tensor) {
        let ids: Vec<_> = inputs.iter().map(|t| t.id()).collect();
        self.session.record_step(&self.name, &ids, output.id());
    }
}

/// The interface every layer implements.
///
/// `forward` takes the input tensors and returns the single output
/// tensor (multi-output modules route extras through their own named
/// surface). `backward` consumes the staged backward arguments and
/// returns the gradient with respect to the first staged input.
pub trait Module {
    fn core(&self) -> &ModuleCore;

    fn forward(&mut self, xs: &[&Tensor]) -> Result<Tensor>;

    fn backward(&mut self) -> Result<Tensor>;

    /// Every parameter this module transitively owns. Leaf modules report
    /// their cache; containers append their children's.
    fn parameters(&self) -> Vec<Parameter> {
        self.core().parameters()
    }

    fn name(&self) -> String {
        self.core().name().to_string()
    }

    /// Train/eval switch; layers without mode-dependent behavior ignore it.
    fn set_training(&mut self, _training: bool) {}

    /// Single-input convenience wrapper around `forward`.
    fn call(&mut self, x: &Tensor) -> Result<Tensor> {
        self.forward(&[x])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_args_visible_after_join() {
        let session = Session::with_workers(2);
        let core = ModuleCore::new(&session, &ComputeBackend::Cpu, "Probe");
        let x = Tensor::ones((2, 2));
        let t1 = core.stage_forward_arg("x", &x);
        let t2 = core.stage_backward_arg("x", &x);
        core.join(vec![t1, t2]).unwrap();
        assert_eq!(core.forward_arg("x").unwrap().id(), x.id());
        assert_eq!(core.backward_arg("x").unwrap().id(), x.id());
        assert!(core.forward_arg("missing").is_err());
    }

    #[test]
    fn output_shape_fixed_after_first_forward() {
        let session = Session::with_workers(1);
        let core = ModuleCore::new(&session, &ComputeBackend::Cpu, "Probe");
        let y1 = core.register_output((2, 3)).unwrap();
        let y2 = core.register_output((2, 3)).unwrap();
        assert_eq!(y1.id(), y2.id());
        assert!(core.register_output((4, 3)).is_err());
        core.reset_output().unwrap();
        let y3 = core.register_output((4, 3)).unwrap();
        assert_eq!(y3.dims(), vec![4, 3]);
    }

    #[test]
    fn bias_placeholder_still_allocates() {
        let session = Session::with_workers(1);
        let core = ModuleCore::new(&session, &ComputeBackend::Cpu, "Probe");
        let b = core.register_bias(false, &Init::Zeros, (8,)).unwrap();
        assert_eq!(b.tensor().size(), 1);
        assert_eq!(core.parameters().len(), 1);
    }
}
