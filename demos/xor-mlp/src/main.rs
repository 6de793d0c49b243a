// XOR — the smallest end-to-end training run
//
// A single linear layer cannot represent XOR; two layers with a
// nonlinearity can. The demo exercises the whole stack: session, module
// graph, staged arguments, backward in reverse execution order, and the
// asynchronous optimizer steps joined by the next forward's accessors.
//
// Architecture: Linear(2→8) → Tanh → Linear(8→1)

use ember::prelude::*;
use tracing::info;

fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let session = Session::new();
    let backend = ComputeBackend::auto();
    info!(device = backend.is_device(), "backend selected");

    // XOR truth table.
    let x = Tensor::from_vec(vec![0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0], (4, 2))?;
    let t = Tensor::from_vec(vec![0.0, 1.0, 1.0, 0.0], (4, 1))?;

    let mut model = Sequential::new(&session, &backend)
        .push(Linear::new(&session, &backend, 2, 8, true)?)
        .push(Activation::tanh(&session, &backend))
        .push(Linear::new(&session, &backend, 8, 1, true)?);
    let mut loss = MseLoss::new(&session, &backend, Reduction::Mean);
    let mut opt = Sgd::new(
        &session,
        &backend,
        model.parameters(),
        0.2,
        0.9,
        0.0,
        0.0,
        false,
    )?;

    for epoch in 0..2000 {
        opt.zero_grad()?;
        let y = model.call(&x)?;
        let l = loss.forward(&[&y, &t])?;
        loss.backward()?;
        model.backward()?;
        opt.step()?;

        if epoch % 200 == 0 {
            info!(epoch, loss = l.to_vec_f32()?[0], "training");
        }
        session.clear_graph();
    }

    let y = model.call(&x)?;
    let predictions = y.to_vec_f32()?;
    info!(?predictions, "final outputs (want ≈ [0, 1, 1, 0])");
    for (i, p) in predictions.iter().enumerate() {
        let target = [0.0, 1.0, 1.0, 0.0][i];
        assert!(
            (p - target).abs() < 0.25,
            "prediction {i} = {p}, expected ≈ {target}"
        );
    }
    info!("XOR learned");
    Ok(())
}
