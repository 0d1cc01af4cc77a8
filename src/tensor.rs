// uScore: featherweight scoring engine for search ranking.
//
// Copyright (C) 2020  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.
//
// Sparse mapped tensors, and the engine that creates and reduces them.
//
// The interpreter core treats tensors as opaque shared handles;
// everything that looks inside one lives behind the TensorEngine trait.
// SimpleTensorEngine is a plain BTreeMap-backed reference
// implementation, adequate for ranking setups with modest label sets.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::vm::Value;


// A cell address: dimension name -> label. Kept sorted so address
// equality is canonical.
pub type Address = BTreeMap<String, String>;


// The reductions an engine understands. Only Sum is reachable from
// compiled programs; Min and Max are for direct engine callers.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Aggr {
    Sum,
    Min,
    Max
}

impl Aggr {
    fn combine(self, a: f64, b: f64) -> f64 {
        match self {
            Aggr::Sum => a + b,
            Aggr::Min => a.min(b),
            Aggr::Max => a.max(b)
        }
    }
}


// What a tensor literal asks the engine to materialize.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorSpec {
    pub dims: Vec<String>,
    pub cells: Vec<(Address, f64)>
}


// A materialized sparse tensor. Addresses are normalized: every cell
// carries a label for every dimension, missing labels become "".
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    dims: Vec<String>,
    cells: BTreeMap<Address, f64>
}

impl Tensor {
    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    pub fn cells(&self) -> &BTreeMap<Address, f64> {
        &self.cells
    }
}


pub trait TensorEngine: Send + Sync {
    // Materialize a tensor from a literal specification.
    fn create(&self, spec: &TensorSpec) -> Arc<Tensor>;

    // Reduce away the named dimensions. An empty dimension list reduces
    // everything; when no dimensions remain the result collapses to a
    // Double. An unknown dimension yields Error.
    fn reduce(&self, tensor: &Tensor, op: Aggr, dims: &[&str]) -> Value;

    // The element-wise "match" product. Both operands must have the
    // same dimension set; cells join on equal addresses.
    fn multiply(&self, a: &Tensor, b: &Tensor) -> Value;
}


pub struct SimpleTensorEngine;

lazy_static! {
    // Shared engine for callers that don't bring their own.
    pub static ref DEFAULT_ENGINE: Arc<dyn TensorEngine> =
        Arc::new(SimpleTensorEngine);
}

impl TensorEngine for SimpleTensorEngine {
    fn create(&self, spec: &TensorSpec) -> Arc<Tensor> {
        let dims: BTreeSet<String> = spec.dims.iter().cloned().collect();
        let mut cells = BTreeMap::new();
        for (address, value) in &spec.cells {
            let full: Address = dims
                .iter()
                .map(|d| {
                    let label = address.get(d).cloned().unwrap_or_default();
                    (d.clone(), label)
                })
                .collect();
            cells.insert(full, *value);
        }
        Arc::new(Tensor {
            dims: dims.into_iter().collect(),
            cells
        })
    }

    fn reduce(&self, tensor: &Tensor, op: Aggr, dims: &[&str]) -> Value {
        for dim in dims {
            if !tensor.dims.iter().any(|d| d == dim) {
                return Value::Error;
            }
        }

        let remaining: Vec<String> = tensor
            .dims
            .iter()
            .filter(|d| !dims.contains(&d.as_str()))
            .cloned()
            .collect();

        if dims.is_empty() || remaining.is_empty() {
            return scalar_reduce(tensor, op);
        }

        let mut cells: BTreeMap<Address, f64> = BTreeMap::new();
        for (address, value) in &tensor.cells {
            let projected: Address = address
                .iter()
                .filter(|&(d, _)| remaining.contains(d))
                .map(|(d, l)| (d.clone(), l.clone()))
                .collect();
            let combined = match cells.get(&projected) {
                Some(&prior) => op.combine(prior, *value),
                None => *value
            };
            cells.insert(projected, combined);
        }
        Value::Tensor(Arc::new(Tensor {
            dims: remaining,
            cells
        }))
    }

    fn multiply(&self, a: &Tensor, b: &Tensor) -> Value {
        if a.dims != b.dims {
            return Value::Error;
        }
        let mut cells = BTreeMap::new();
        for (address, left) in &a.cells {
            if let Some(right) = b.cells.get(address) {
                cells.insert(address.clone(), left * right);
            }
        }
        Value::Tensor(Arc::new(Tensor {
            dims: a.dims.clone(),
            cells
        }))
    }
}


// Fold every cell into a single scalar. An empty tensor sums to zero,
// but has no minimum or maximum.
fn scalar_reduce(tensor: &Tensor, op: Aggr) -> Value {
    let mut values = tensor.cells.values();
    match values.next() {
        None => match op {
            Aggr::Sum => Value::Double(0.0),
            _ => Value::Error
        },
        Some(first) => {
            Value::Double(values.fold(*first, |acc, v| op.combine(acc, *v)))
        }
    }
}
