//! The reference accelerator: turns recorded networks into [`RefEngine`]s.

use std::sync::Arc;

use tracing::debug;

use splice::backend::{
    AcceleratorBackend, BackendError, BackendResult, BuilderConfig, Engine, NetworkDefinition,
};
use splice::config::{Device, DeviceType, EngineCapability, Precision};
use splice::ir::types::static_dims;

use crate::engine::{output_bindings, EnginePlan, RefEngine};
use crate::network::RefNetwork;

pub const BACKEND_NAME: &str = "ref";

#[derive(Debug, Default, Clone, Copy)]
pub struct RefBackend;

impl RefBackend {
    pub fn new() -> Self {
        Self
    }
}

/// Fixed-function cores only run reduced-precision kernels.
fn check_device(config: &BuilderConfig) -> BackendResult<()> {
    let dla = config.device.device_type == DeviceType::Dla;
    if config.capability == EngineCapability::DlaStandalone && !dla {
        return Err(BackendError::new("DlaStandalone capability needs a DLA device"));
    }
    if !dla {
        return Ok(());
    }
    let reduced = config.precisions.contains(&Precision::Half) || config.precisions.contains(&Precision::Int8);
    if !reduced && !config.device.allow_gpu_fallback {
        return Err(BackendError::new(format!(
            "{} only runs half or int8 layers; enable half/int8 precision or allow GPU fallback",
            config.device
        )));
    }
    Ok(())
}

/// Bytes of activation memory the network needs at its largest input profile.
/// Fails at the first layer that pushes the total past `limit`.
fn check_workspace(network: &RefNetwork, limit: Option<u64>) -> BackendResult<u64> {
    let max_dims: Vec<Vec<usize>> = network
        .inputs()
        .iter()
        .map(|input| input.shape.max().to_vec())
        .collect();
    let tensors = network.concrete_shapes(&max_dims)?;
    let mut total = 0u64;
    for (index, layer) in network.layers().iter().enumerate() {
        let desc = &tensors[layer.output.0 as usize];
        let elements: usize = static_dims(&desc.dims).map_or(0, |dims| dims.iter().product());
        total += (elements * desc.dtype.size_in_bytes()) as u64;
        if let Some(limit) = limit {
            if total > limit {
                return Err(BackendError::at_layer(
                    index,
                    format!(
                        "layer `{}` needs {total} bytes of workspace, limit is {limit}",
                        layer.name
                    ),
                ));
            }
        }
    }
    Ok(total)
}

impl AcceleratorBackend for RefBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn create_network(&self) -> Box<dyn NetworkDefinition> {
        Box::new(RefNetwork::new())
    }

    fn build(&self, network: Box<dyn NetworkDefinition>, config: &BuilderConfig) -> BackendResult<Arc<dyn Engine>> {
        let network = network
            .into_any()
            .downcast::<RefNetwork>()
            .map_err(|_| BackendError::new("network was not created by the reference backend"))?;
        check_device(config)?;
        if network.outputs().is_empty() {
            return Err(BackendError::new("network marks no outputs"));
        }
        let workspace = check_workspace(&network, config.workspace_size)?;
        let outputs = output_bindings(&network)?;
        let inputs = network
            .inputs()
            .iter()
            .map(|input| splice::backend::EngineBinding {
                name: input.name.clone(),
                dtype: input.dtype,
                shape: input.shape.clone(),
            })
            .collect();
        let reduced_precision = config.precisions.contains(&Precision::Half);
        debug!(
            layers = network.layer_count(),
            workspace,
            reduced_precision,
            device = %config.device,
            "built reference engine"
        );
        Ok(Arc::new(RefEngine::new(EnginePlan {
            network: *network,
            inputs,
            outputs,
            reduced_precision,
            device_type: config.device.device_type,
        })))
    }

    fn deserialize_engine(&self, bytes: &[u8], device: &Device) -> BackendResult<Arc<dyn Engine>> {
        let engine = RefEngine::from_bytes(bytes)?;
        if engine.device_type() != device.device_type {
            return Err(BackendError::new(format!(
                "engine was built for {:?}, cannot load it on {device}",
                engine.device_type()
            )));
        }
        Ok(Arc::new(engine))
    }
}
