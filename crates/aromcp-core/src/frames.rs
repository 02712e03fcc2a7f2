//! Call and loop frames for the control-flow interpreter.
//!
//! An instance executes a stack of `ExecutionFrame`s (step list + cursor).
//! Conditionals push a branch frame; loops push one body frame per
//! iteration, tied to a `LoopFrame` on the loop stack that tracks iteration
//! state and break/continue requests. Both stacks are append-only vectors
//! addressed by index, which keeps break/continue targeting simple.

use serde_json::{Map, Value};

use aromcp_types::workflow::StepDefinition;

// ---------------------------------------------------------------------------
// Loop frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    While,
    Foreach,
}

/// Iteration state for one active loop.
#[derive(Debug, Clone)]
pub struct LoopFrame {
    pub kind: LoopKind,
    /// Id of the loop step that created this frame.
    pub step_id: String,
    /// Loop condition (while loops re-evaluate it before every iteration).
    pub condition: Option<String>,
    /// Items materialized once at foreach entry.
    pub items: Vec<Value>,
    /// Current foreach index.
    pub index: usize,
    /// Foreach custom variable name.
    pub variable_name: Option<String>,
    /// Completed iterations: 1-indexed for while, index+1 for foreach.
    pub iteration: u64,
    pub max_iterations: u64,
    pub break_requested: bool,
    pub continue_requested: bool,
    /// Body steps, re-instantiated per iteration.
    pub body: Vec<StepDefinition>,
}

impl LoopFrame {
    /// The `loop.*` bindings exposed to expressions and templates.
    pub fn bindings(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self.kind {
            LoopKind::Foreach => {
                map.insert(
                    "item".to_string(),
                    self.items.get(self.index).cloned().unwrap_or(Value::Null),
                );
                map.insert("index".to_string(), Value::from(self.index as u64));
                map.insert("iteration".to_string(), Value::from(self.index as u64 + 1));
            }
            LoopKind::While => {
                map.insert("iteration".to_string(), Value::from(self.iteration));
            }
        }
        map
    }

    /// The custom-variable binding (`<variable_name> = items[index]`),
    /// merged into the bare scope for convenience.
    pub fn variable_binding(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let (LoopKind::Foreach, Some(name)) = (self.kind, &self.variable_name) {
            map.insert(
                name.clone(),
                self.items.get(self.index).cloned().unwrap_or(Value::Null),
            );
        }
        map
    }
}

// ---------------------------------------------------------------------------
// Execution frames
// ---------------------------------------------------------------------------

/// One entry of the call stack: a step list and the cursor into it.
#[derive(Debug, Clone)]
pub struct ExecutionFrame {
    pub steps: Vec<StepDefinition>,
    pub cursor: usize,
    /// Index into the loop stack when this frame is a loop body.
    pub owning_loop: Option<usize>,
    /// Step that pushed this frame (conditional or loop id), for tracing.
    pub source_step: Option<String>,
}

impl ExecutionFrame {
    pub fn new(steps: Vec<StepDefinition>) -> Self {
        Self {
            steps,
            cursor: 0,
            owning_loop: None,
            source_step: None,
        }
    }

    pub fn for_loop_body(
        steps: Vec<StepDefinition>,
        loop_index: usize,
        source_step: &str,
    ) -> Self {
        Self {
            steps,
            cursor: 0,
            owning_loop: Some(loop_index),
            source_step: Some(source_step.to_string()),
        }
    }

    pub fn for_branch(steps: Vec<StepDefinition>, source_step: &str) -> Self {
        Self {
            steps,
            cursor: 0,
            owning_loop: None,
            source_step: Some(source_step.to_string()),
        }
    }

    pub fn exhausted(&self) -> bool {
        self.cursor >= self.steps.len()
    }

    /// The step at the cursor, if any.
    pub fn current(&self) -> Option<&StepDefinition> {
        self.steps.get(self.cursor)
    }
}

// ---------------------------------------------------------------------------
// Frame stacks
// ---------------------------------------------------------------------------

/// The call and loop stacks of one instance.
#[derive(Debug, Clone, Default)]
pub struct Frames {
    pub call_stack: Vec<ExecutionFrame>,
    pub loop_stack: Vec<LoopFrame>,
}

impl Frames {
    /// Seed the root frame.
    pub fn with_root(steps: Vec<StepDefinition>) -> Self {
        Self {
            call_stack: vec![ExecutionFrame::new(steps)],
            loop_stack: Vec::new(),
        }
    }

    pub fn innermost_loop(&self) -> Option<&LoopFrame> {
        self.loop_stack.last()
    }

    pub fn innermost_loop_mut(&mut self) -> Option<&mut LoopFrame> {
        self.loop_stack.last_mut()
    }

    /// `loop.*` bindings from the innermost loop, if inside one.
    pub fn loop_bindings(&self) -> Option<Map<String, Value>> {
        self.innermost_loop().map(LoopFrame::bindings)
    }

    /// Custom-variable bindings from every active foreach, outermost
    /// first so inner loops shadow outer ones.
    pub fn variable_bindings(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for frame in &self.loop_stack {
            for (k, v) in frame.variable_binding() {
                map.insert(k, v);
            }
        }
        map
    }

    /// Pop call frames until (and including) the body frame of the
    /// innermost loop. Returns the loop index, or None when no call frame
    /// belongs to a loop (break/continue outside a loop).
    ///
    /// Conditional branch frames nested inside the loop body unwind
    /// transparently, so a break inside `then_steps` targets the loop.
    pub fn unwind_to_innermost_loop(&mut self) -> Option<usize> {
        let target = self
            .call_stack
            .iter()
            .rposition(|frame| frame.owning_loop.is_some())?;
        let loop_index = self.call_stack[target].owning_loop;
        self.call_stack.truncate(target);
        loop_index
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use aromcp_types::workflow::StepConfig;
    use serde_json::json;

    fn step(id: &str) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            config: StepConfig::Break {},
        }
    }

    fn foreach_frame(items: Vec<Value>, index: usize) -> LoopFrame {
        LoopFrame {
            kind: LoopKind::Foreach,
            step_id: "step_010".to_string(),
            condition: None,
            items,
            index,
            variable_name: Some("letter".to_string()),
            iteration: index as u64 + 1,
            max_iterations: 100,
            break_requested: false,
            continue_requested: false,
            body: vec![],
        }
    }

    // -------------------------------------------------------------------
    // Bindings
    // -------------------------------------------------------------------

    #[test]
    fn test_foreach_bindings() {
        let frame = foreach_frame(vec![json!("a"), json!("b")], 1);
        let bindings = frame.bindings();
        assert_eq!(bindings["item"], json!("b"));
        assert_eq!(bindings["index"], json!(1));
        assert_eq!(bindings["iteration"], json!(2));
        assert_eq!(frame.variable_binding()["letter"], json!("b"));
    }

    #[test]
    fn test_while_bindings() {
        let frame = LoopFrame {
            kind: LoopKind::While,
            step_id: "step_002".to_string(),
            condition: Some("this.i < 5".to_string()),
            items: vec![],
            index: 0,
            variable_name: None,
            iteration: 3,
            max_iterations: 100,
            break_requested: false,
            continue_requested: false,
            body: vec![],
        };
        let bindings = frame.bindings();
        assert_eq!(bindings["iteration"], json!(3));
        assert!(bindings.get("item").is_none());
        assert!(frame.variable_binding().is_empty());
    }

    #[test]
    fn test_inner_loop_variable_shadows_outer() {
        let mut frames = Frames::default();
        let mut outer = foreach_frame(vec![json!("o")], 0);
        outer.variable_name = Some("x".to_string());
        let mut inner = foreach_frame(vec![json!("i")], 0);
        inner.variable_name = Some("x".to_string());
        frames.loop_stack.push(outer);
        frames.loop_stack.push(inner);
        assert_eq!(frames.variable_bindings()["x"], json!("i"));
    }

    // -------------------------------------------------------------------
    // Unwinding
    // -------------------------------------------------------------------

    #[test]
    fn test_unwind_reaches_innermost_loop_body() {
        let mut frames = Frames::with_root(vec![step("step_001")]);
        frames.loop_stack.push(foreach_frame(vec![json!("a")], 0));
        frames
            .call_stack
            .push(ExecutionFrame::for_loop_body(vec![step("step_002")], 0, "step_010"));
        // Conditional branch frame inside the loop body
        frames
            .call_stack
            .push(ExecutionFrame::for_branch(vec![step("step_003")], "step_002"));

        let loop_index = frames.unwind_to_innermost_loop();
        assert_eq!(loop_index, Some(0));
        // Branch frame and body frame both gone; root remains
        assert_eq!(frames.call_stack.len(), 1);
    }

    #[test]
    fn test_unwind_outside_loop_is_none() {
        let mut frames = Frames::with_root(vec![step("step_001")]);
        frames
            .call_stack
            .push(ExecutionFrame::for_branch(vec![step("step_002")], "step_001"));
        assert_eq!(frames.unwind_to_innermost_loop(), None);
        // Nothing unwound on a miss
        assert_eq!(frames.call_stack.len(), 2);
    }

    #[test]
    fn test_nested_loops_unwind_only_inner() {
        let mut frames = Frames::with_root(vec![]);
        frames.loop_stack.push(foreach_frame(vec![json!(1)], 0)); // outer
        frames
            .call_stack
            .push(ExecutionFrame::for_loop_body(vec![], 0, "outer"));
        frames.loop_stack.push(foreach_frame(vec![json!(2)], 0)); // inner
        frames
            .call_stack
            .push(ExecutionFrame::for_loop_body(vec![], 1, "inner"));

        let loop_index = frames.unwind_to_innermost_loop();
        assert_eq!(loop_index, Some(1));
        // Outer body frame intact
        assert_eq!(frames.call_stack.len(), 2);
        assert_eq!(frames.loop_stack.len(), 2);
    }
}
