//! Operator and variable descriptions.
//!
//! An [`OpDesc`] names the variables it reads and writes through named
//! slots (`"Input"`, `"Filter"`, `"Output"`, ...). The graph keeps these
//! names in agreement with its edges; see [`Graph::validate`](crate::Graph::validate).

use std::collections::BTreeMap;
use std::fmt;

use crate::attr::Attribute;

/// Element type of a variable.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub enum DataType {
    #[default]
    F32,
    I8,
    U8,
    I32,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::F32 => "f32",
            Self::I8 => "i8",
            Self::U8 => "u8",
            Self::I32 => "i32",
        })
    }
}

/// Declaration of a variable (tensor) flowing through the graph.
#[derive(Clone, Debug, PartialEq)]
pub struct VarDesc {
    /// Unique name, also the key into the [`Scope`](crate::Scope).
    pub name: String,
    /// Persistable variables (weights, biases) outlive a single run.
    pub persistable: bool,
    /// Declared shape; `-1` marks a dynamic dimension.
    pub shape: Vec<i64>,
    /// Element type.
    pub dtype: DataType,
}

impl VarDesc {
    /// A non-persistable `f32` variable with an unknown shape.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            persistable: false,
            shape: Vec::new(),
            dtype: DataType::F32,
        }
    }

    pub fn persistable(mut self, persistable: bool) -> Self {
        self.persistable = persistable;
        self
    }

    pub fn with_shape(mut self, shape: &[i64]) -> Self {
        self.shape = shape.to_vec();
        self
    }

    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }
}

/// Description of a single operator.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OpDesc {
    /// Operator type, e.g. `"conv2d"`.
    pub op_type: String,
    /// Input slot name to the variables bound to it.
    pub inputs: BTreeMap<String, Vec<String>>,
    /// Output slot name to the variables bound to it.
    pub outputs: BTreeMap<String, Vec<String>>,
    /// Named attributes.
    pub attrs: BTreeMap<String, Attribute>,
}

impl OpDesc {
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            ..Self::default()
        }
    }

    /// Builder form of [`set_input`](Self::set_input).
    pub fn with_input<S: Into<String>>(
        mut self,
        slot: impl Into<String>,
        vars: impl IntoIterator<Item = S>,
    ) -> Self {
        self.set_input(slot, vars);
        self
    }

    /// Builder form of [`set_output`](Self::set_output).
    pub fn with_output<S: Into<String>>(
        mut self,
        slot: impl Into<String>,
        vars: impl IntoIterator<Item = S>,
    ) -> Self {
        self.set_output(slot, vars);
        self
    }

    /// Builder form of [`set_attr`](Self::set_attr).
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<Attribute>) -> Self {
        self.set_attr(name, value);
        self
    }

    /// Binds `vars` to the input `slot`, replacing any previous binding.
    pub fn set_input<S: Into<String>>(
        &mut self,
        slot: impl Into<String>,
        vars: impl IntoIterator<Item = S>,
    ) {
        self.inputs
            .insert(slot.into(), vars.into_iter().map(Into::into).collect());
    }

    /// Binds `vars` to the output `slot`, replacing any previous binding.
    pub fn set_output<S: Into<String>>(
        &mut self,
        slot: impl Into<String>,
        vars: impl IntoIterator<Item = S>,
    ) {
        self.outputs
            .insert(slot.into(), vars.into_iter().map(Into::into).collect());
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<Attribute>) {
        self.attrs.insert(name.into(), value.into());
    }

    /// Variables bound to an input slot (empty if the slot is absent).
    pub fn input(&self, slot: &str) -> &[String] {
        self.inputs.get(slot).map(Vec::as_slice).unwrap_or_default()
    }

    /// Variables bound to an output slot (empty if the slot is absent).
    pub fn output(&self, slot: &str) -> &[String] {
        self.outputs.get(slot).map(Vec::as_slice).unwrap_or_default()
    }

    /// All input variable names across every slot, in slot order.
    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.values().flatten().map(String::as_str)
    }

    /// All output variable names across every slot, in slot order.
    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.values().flatten().map(String::as_str)
    }

    /// Returns `true` if `var` appears in any input slot.
    pub fn reads(&self, var: &str) -> bool {
        self.input_names().any(|n| n == var)
    }

    /// Returns `true` if `var` appears in any output slot.
    pub fn writes(&self, var: &str) -> bool {
        self.output_names().any(|n| n == var)
    }

    /// Replaces `old` with `new` in every input slot. Returns `true` if
    /// anything was renamed.
    pub fn rename_input(&mut self, old: &str, new: &str) -> bool {
        rename_in(&mut self.inputs, old, new)
    }

    /// Replaces `old` with `new` in every output slot.
    pub fn rename_output(&mut self, old: &str, new: &str) -> bool {
        rename_in(&mut self.outputs, old, new)
    }

    /// Replaces `old` with `new` in one input slot only.
    pub fn replace_input(&mut self, slot: &str, old: &str, new: &str) -> bool {
        replace_in_slot(&mut self.inputs, slot, old, new)
    }

    /// Replaces `old` with `new` in one output slot only.
    pub fn replace_output(&mut self, slot: &str, old: &str, new: &str) -> bool {
        replace_in_slot(&mut self.outputs, slot, old, new)
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    pub fn attr(&self, name: &str) -> Option<&Attribute> {
        self.attrs.get(name)
    }

    /// Boolean attribute lookup; `None` if absent or not a bool.
    pub fn attr_bool(&self, name: &str) -> Option<bool> {
        self.attr(name).and_then(Attribute::as_bool)
    }

    /// Float attribute lookup; `None` if absent or not a float.
    pub fn attr_float(&self, name: &str) -> Option<f32> {
        self.attr(name).and_then(Attribute::as_float)
    }

    pub fn attr_int(&self, name: &str) -> Option<i64> {
        self.attr(name).and_then(Attribute::as_int)
    }
}

fn rename_in(slots: &mut BTreeMap<String, Vec<String>>, old: &str, new: &str) -> bool {
    let mut renamed = false;
    for name in slots.values_mut().flatten() {
        if name == old {
            *name = new.to_string();
            renamed = true;
        }
    }
    renamed
}

fn replace_in_slot(
    slots: &mut BTreeMap<String, Vec<String>>,
    slot: &str,
    old: &str,
    new: &str,
) -> bool {
    let mut replaced = false;
    if let Some(vars) = slots.get_mut(slot) {
        for name in vars.iter_mut().filter(|n| n.as_str() == old) {
            *name = new.to_string();
            replaced = true;
        }
    }
    replaced
}

/// A linear program: variable declarations plus operators in execution
/// order. This is the form the host hands over and receives back.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProgramDesc {
    pub vars: Vec<VarDesc>,
    pub ops: Vec<OpDesc>,
}

impl ProgramDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn var(&self, name: &str) -> Option<&VarDesc> {
        self.vars.iter().find(|v| v.name == name)
    }
}
