//! Buffer arena: fixed-shape tensors that cross the accelerator boundary.
//!
//! Each [`AcceleratorModel`](crate::accelerator::AcceleratorModel) owns one
//! arena, allocated once from its [`ShapeContract`] at open time. Inputs are
//! overwritten in place before every call; outputs are overwritten in place by
//! the accelerator, so a view taken from an output always points at the same
//! memory from one call to the next.
//!
//! Host-side storage is always `f32`. [`ElementType`] records what the native
//! model expects so a backend can convert at the boundary.

use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, CowArray, IxDyn};
use serde::{Deserialize, Serialize};

use crate::accelerator::contract::{InputBinding, ShapeContract};
use crate::error::{DecodeError, Result};

/// Element type at the native boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    F16,
    F32,
}

impl ElementType {
    pub fn size_bytes(self) -> usize {
        match self {
            ElementType::F16 => 2,
            ElementType::F32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRole {
    /// Written by the caller before each call.
    Input,
    /// Written by the accelerator; identity is stable across calls.
    Output,
}

/// One contiguous, fixed-shape tensor.
#[derive(Debug)]
pub struct BufferDescriptor {
    name: String,
    dtype: ElementType,
    role: BufferRole,
    data: ArrayD<f32>,
}

impl BufferDescriptor {
    pub fn zeros(name: impl Into<String>, shape: &[usize], dtype: ElementType, role: BufferRole) -> Self {
        Self {
            name: name.into(),
            dtype,
            role,
            data: ArrayD::zeros(IxDyn(shape)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    pub fn role(&self) -> BufferRole {
        self.role
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn view(&self) -> ArrayViewD<'_, f32> {
        self.data.view()
    }

    pub fn view_mut(&mut self) -> ArrayViewMutD<'_, f32> {
        self.data.view_mut()
    }

    /// Start of the backing storage. Used to check buffer identity.
    pub fn as_ptr(&self) -> *const f32 {
        self.data.as_ptr()
    }

    /// Copy `src` into this buffer. The shape must match exactly; buffers are
    /// never resized.
    pub fn write(&mut self, src: &ArrayViewD<'_, f32>) -> Result<()> {
        if src.shape() != self.data.shape() {
            return Err(DecodeError::shape(&self.name, self.data.shape(), src.shape()));
        }
        self.data.assign(src);
        Ok(())
    }

    /// Copy a flat, row-major slice into this buffer.
    pub fn write_flat(&mut self, src: &[f32]) -> Result<()> {
        if src.len() != self.data.len() {
            return Err(DecodeError::shape(&self.name, &[self.data.len()], &[src.len()]));
        }
        // Arena buffers are allocated in standard layout and never re-laid out.
        match self.data.as_slice_mut() {
            Some(dst) => dst.copy_from_slice(src),
            None => {
                for (d, s) in self.data.iter_mut().zip(src) {
                    *d = *s;
                }
            }
        }
        Ok(())
    }

    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}

/// All buffers one accelerator model needs, allocated once.
#[derive(Debug, Default)]
pub struct BufferArena {
    inputs: Vec<BufferDescriptor>,
    outputs: Vec<BufferDescriptor>,
}

impl BufferArena {
    /// Allocate every arena-bound input and every output of `contract`.
    ///
    /// Inputs bound to caller-owned storage (KV caches) are not allocated
    /// here; the caller passes them at predict time.
    pub fn for_contract(contract: &ShapeContract) -> Self {
        let inputs = contract
            .inputs()
            .filter(|spec| spec.binding == InputBinding::Arena)
            .map(|spec| BufferDescriptor::zeros(spec.name, &spec.shape, spec.dtype, BufferRole::Input))
            .collect();
        let outputs = contract
            .outputs()
            .map(|spec| BufferDescriptor::zeros(spec.name, &spec.shape, spec.dtype, BufferRole::Output))
            .collect();
        Self { inputs, outputs }
    }

    pub fn input(&self, name: &str) -> Result<&BufferDescriptor> {
        find(&self.inputs, name)
    }

    pub fn input_mut(&mut self, name: &str) -> Result<&mut BufferDescriptor> {
        find_mut(&mut self.inputs, name)
    }

    pub fn output(&self, name: &str) -> Result<&BufferDescriptor> {
        find(&self.outputs, name)
    }

    pub fn output_mut(&mut self, name: &str) -> Result<&mut BufferDescriptor> {
        find_mut(&mut self.outputs, name)
    }

    pub fn inputs(&self) -> &[BufferDescriptor] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[BufferDescriptor] {
        &self.outputs
    }

    /// Borrow inputs immutably and outputs mutably for one native call.
    pub fn split_io(&mut self) -> (&[BufferDescriptor], &mut [BufferDescriptor]) {
        (&self.inputs, &mut self.outputs)
    }

    pub fn allocated_bytes(&self) -> usize {
        self.buffers().map(BufferDescriptor::size_bytes).sum()
    }

    /// Bytes the native model sees for these buffers, after f16 narrowing.
    pub fn boundary_bytes(&self) -> usize {
        self.buffers().map(|b| b.len() * b.dtype().size_bytes()).sum()
    }

    /// Every buffer, inputs first.
    pub fn buffers(&self) -> impl Iterator<Item = &BufferDescriptor> {
        self.inputs.iter().chain(self.outputs.iter())
    }
}

fn find<'a>(buffers: &'a [BufferDescriptor], name: &str) -> Result<&'a BufferDescriptor> {
    buffers
        .iter()
        .find(|b| b.name == name)
        .ok_or_else(|| DecodeError::Accelerator(format!("no buffer named `{name}`")))
}

fn find_mut<'a>(buffers: &'a mut [BufferDescriptor], name: &str) -> Result<&'a mut BufferDescriptor> {
    buffers
        .iter_mut()
        .find(|b| b.name == name)
        .ok_or_else(|| DecodeError::Accelerator(format!("no buffer named `{name}`")))
}

/// Force standard (row-major, contiguous) layout before a native call.
///
/// Upstream views may be strided slices or transposes; the native side reads
/// raw row-major memory. Borrowed when already contiguous, copied otherwise.
pub fn ensure_contiguous<'a>(view: ArrayViewD<'a, f32>) -> CowArray<'a, f32, IxDyn> {
    if view.is_standard_layout() {
        CowArray::from(view)
    } else {
        CowArray::from(view.as_standard_layout().into_owned())
    }
}
