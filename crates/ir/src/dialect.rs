//! Task operations understood by the tuning engine.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    F32,
    F16,
    BF16,
}

impl DataType {
    pub fn element_type(&self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
        }
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 | DataType::BF16 => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DataType,
}

impl TensorSpec {
    pub fn new<N: Into<String>>(name: N, shape: Vec<usize>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
        }
    }

    /// Shape and element type, e.g. `128x64xf32`.
    pub fn type_string(&self) -> String {
        if self.shape.is_empty() {
            return self.dtype.element_type().to_string();
        }
        let dims = self
            .shape
            .iter()
            .map(|dim| dim.to_string())
            .collect::<Vec<_>>()
            .join("x");
        format!("{}x{}", dims, self.dtype.element_type())
    }

    /// Rows and columns of a rank-2 tensor.
    pub fn dims2(&self) -> Option<(usize, usize)> {
        match self.shape.as_slice() {
            [rows, cols] => Some((*rows, *cols)),
            _ => None,
        }
    }

    /// Storage size in bytes, or `None` when it does not fit in `usize`.
    pub fn byte_size(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(self.dtype.size_bytes(), |bytes, dim| bytes.checked_mul(*dim))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActivationKind {
    #[default]
    None,
    Relu,
    Gelu,
}

impl ActivationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationKind::None => "none",
            ActivationKind::Relu => "relu",
            ActivationKind::Gelu => "gelu",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatmulOp {
    pub lhs: TensorSpec,
    pub rhs: TensorSpec,
    pub result: TensorSpec,
    pub bias: Option<TensorSpec>,
    pub activation: ActivationKind,
    /// Apply bias and activation inside the tiled loop instead of a separate sweep.
    #[serde(default)]
    pub fuse_epilogue: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttentionOp {
    pub query: TensorSpec,
    pub key: TensorSpec,
    pub value: TensorSpec,
    pub mask: Option<TensorSpec>,
    pub result: TensorSpec,
    pub scale: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MlpOp {
    pub input: TensorSpec,
    pub hidden: TensorSpec,
    pub output: TensorSpec,
    pub activation: ActivationKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LayerNormOp {
    pub input: TensorSpec,
    pub epsilon: f32,
    pub result: TensorSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Matmul(MatmulOp),
    Attention(AttentionOp),
    Mlp(MlpOp),
    LayerNorm(LayerNormOp),
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Matmul(_) => "matmul",
            Operation::Attention(_) => "attention",
            Operation::Mlp(_) => "mlp",
            Operation::LayerNorm(_) => "layer_norm",
        }
    }

    /// Every tensor the operation touches, operands first.
    pub fn tensors(&self) -> Vec<&TensorSpec> {
        match self {
            Operation::Matmul(op) => {
                let mut tensors = vec![&op.lhs, &op.rhs];
                tensors.extend(op.bias.as_ref());
                tensors.push(&op.result);
                tensors
            }
            Operation::Attention(op) => {
                let mut tensors = vec![&op.query, &op.key, &op.value];
                tensors.extend(op.mask.as_ref());
                tensors.push(&op.result);
                tensors
            }
            Operation::Mlp(op) => vec![&op.input, &op.hidden, &op.output],
            Operation::LayerNorm(op) => vec![&op.input, &op.result],
        }
    }

    /// The `[m, n, k]` loop nest bounding every schedule tile.
    ///
    /// Matmul iterates rows, columns and the reduction. Attention iterates
    /// query rows, value columns and key rows. Layer norm iterates rows and
    /// features and has a unit reduction extent. An MLP reports its up
    /// projection.
    pub fn loop_extents(&self) -> [usize; 3] {
        fn dims(spec: &TensorSpec) -> (usize, usize) {
            spec.dims2().unwrap_or((1, 1))
        }
        match self {
            Operation::Matmul(op) => {
                let (m, k) = dims(&op.lhs);
                let (_, n) = dims(&op.rhs);
                [m, n, k]
            }
            Operation::Attention(op) => {
                let (s, _) = dims(&op.query);
                let (t, dv) = dims(&op.value);
                [s, dv, t]
            }
            Operation::Mlp(op) => {
                let (m, d) = dims(&op.input);
                let (_, h) = dims(&op.hidden);
                [m, h, d]
            }
            Operation::LayerNorm(op) => {
                let (rows, cols) = dims(&op.input);
                [rows, cols, 1]
            }
        }
    }

    /// Canonical structural key. Task names never participate, so two tasks
    /// with identical structure share tuning records.
    pub fn signature(&self) -> String {
        let shapes = self
            .tensors()
            .iter()
            .map(|tensor| tensor.type_string())
            .collect::<Vec<_>>()
            .join(",");
        let attrs = match self {
            Operation::Matmul(op) => format!(
                "bias={};act={}",
                op.bias.is_some(),
                op.activation.as_str()
            ),
            Operation::Attention(op) => format!("mask={};scale={:.6}", op.mask.is_some(), op.scale),
            Operation::Mlp(op) => format!("act={}", op.activation.as_str()),
            Operation::LayerNorm(op) => format!("eps={:e}", op.epsilon),
        };
        format!("{}({})[{}]", self.kind(), shapes, attrs)
    }

    pub fn flops(&self) -> f64 {
        let [m, n, k] = self.loop_extents().map(|extent| extent as f64);
        match self {
            Operation::Matmul(_) => 2.0 * m * n * k,
            Operation::Attention(op) => {
                let d = op.query.dims2().map(|(_, d)| d as f64).unwrap_or(1.0);
                2.0 * m * k * d + 2.0 * m * k * n + 5.0 * m * k
            }
            Operation::Mlp(_) => 4.0 * m * n * k,
            Operation::LayerNorm(_) => 5.0 * m * n,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature())
    }
}
