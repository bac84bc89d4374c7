//! Latent → mesh decoding.
//!
//! Wraps the transmitter's `decode_latent_mesh(..).tri_mesh()`. Rejects
//! latents of the wrong shape before the call and enforces the mesh
//! post-condition after it, so a decoder fault can never reach the writer
//! as a silently degenerate mesh.

use std::time::Instant;

use crate::error::describe_fault;
use crate::mesh::TriMesh;
use crate::model::{Latent, ModelBundle};
use crate::{Error, Result};

/// Stateless wrapper around the external decode call. Adds no randomness.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeshDecoder;

impl MeshDecoder {
    pub fn decode(&self, latent: &Latent, bundle: &ModelBundle) -> Result<TriMesh> {
        let latent_dim = bundle.latent_dim();
        if latent.dims() != &[latent_dim] {
            return Err(Error::Decode(format!(
                "malformed latent: expected shape [{latent_dim}], got {:?}",
                latent.dims()
            )));
        }

        let started = Instant::now();
        let mesh = {
            let _guard = bundle.inference_guard();
            bundle.transmitter.decode_latent_mesh(latent.tensor())
        }
        .map_err(|e| Error::Decode(describe_fault(&e)))?;

        mesh.validate()
            .map_err(|e| Error::Decode(format!("decoder produced an unusable mesh: {e}")))?;

        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            vertices = mesh.vertex_count(),
            faces = mesh.face_count(),
            colored = mesh.has_vertex_colors(),
            "mesh decoded"
        );
        Ok(mesh)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use candle_core::{DType, Device, Tensor};

    use super::*;
    use crate::config::InferencePolicy;
    use crate::model::toy::{ToyLoader, TOY_LATENT_DIM};
    use crate::model::{DiffusionConfig, ModelLoader, Transmitter};

    /// Emits a mesh whose last face points past the vertex list.
    struct BrokenTransmitter;

    impl Transmitter for BrokenTransmitter {
        fn latent_dim(&self) -> usize {
            TOY_LATENT_DIM
        }

        fn decode_latent_mesh(&self, _latent: &Tensor) -> candle_core::Result<TriMesh> {
            Ok(TriMesh::new(
                vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
                vec![[0, 1, 2], [0, 2, 7]],
            ))
        }
    }

    fn bundle(transmitter: Arc<dyn Transmitter>) -> ModelBundle {
        let device = Device::Cpu;
        let text_model = ToyLoader::default().load_text_model(&device).unwrap();
        ModelBundle::new(
            transmitter,
            text_model,
            DiffusionConfig::default(),
            device,
            InferencePolicy::Auto,
        )
    }

    fn toy_bundle() -> ModelBundle {
        let transmitter = ToyLoader::default().load_transmitter(&Device::Cpu).unwrap();
        bundle(transmitter)
    }

    fn latent(values: Vec<f32>) -> Latent {
        let len = values.len();
        Latent::new(Tensor::from_vec(values, len, &Device::Cpu).unwrap())
    }

    #[test]
    fn test_decode_is_deterministic() {
        let bundle = toy_bundle();
        let values: Vec<f32> = (0..TOY_LATENT_DIM).map(|i| (i as f32 * 0.37).sin()).collect();
        let latent = latent(values);

        let first = MeshDecoder.decode(&latent, &bundle).unwrap();
        let second = MeshDecoder.decode(&latent, &bundle).unwrap();
        assert_eq!(first.vertex_count(), second.vertex_count());
        assert_eq!(first.face_count(), second.face_count());
        assert_eq!(first, second);
    }

    #[test]
    fn test_rejects_wrong_dimensionality() {
        let bundle = toy_bundle();
        let short = latent(vec![0.0; TOY_LATENT_DIM - 1]);
        let err = MeshDecoder.decode(&short, &bundle).unwrap_err();
        assert!(matches!(err, Error::Decode(_)), "{err}");
        assert!(err.to_string().contains("malformed latent"));

        let batched = Latent::new(
            Tensor::zeros((1, TOY_LATENT_DIM), DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(matches!(
            MeshDecoder.decode(&batched, &bundle),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_rejects_out_of_bounds_faces() {
        let bundle = bundle(Arc::new(BrokenTransmitter));
        let err = MeshDecoder
            .decode(&latent(vec![0.0; TOY_LATENT_DIM]), &bundle)
            .unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert!(err.to_string().contains("references vertex 7"), "{err}");
    }
}
