use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::operator::{BuildContext, Operator, OperatorConfig};
use crate::{Error, Result};

/// A named directed acyclic graph of operators.
///
/// Operators live in an arena; adjacency is kept as indices so the graph
/// can be validated and rendered without touching the operators
/// themselves. Dispatch goes through the operators' resolved successor
/// pointers.
pub struct Pipeline {
    operators: Vec<Arc<dyn Operator>>,
    adjacency: Vec<Vec<usize>>,

    /// Topological order, inputs first.
    order: Vec<usize>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field(
                "operators",
                &self.operators.iter().map(|op| op.id()).collect::<Vec<_>>(),
            )
            .field("adjacency", &self.adjacency)
            .field("order", &self.order)
            .finish()
    }
}

impl Pipeline {
    /// Builds and validates a pipeline from an ordered list of operator
    /// configs.
    pub fn build(configs: &[Box<dyn OperatorConfig>], context: &BuildContext) -> Result<Pipeline> {
        if configs.is_empty() {
            return Err(Error::config("pipeline has no operators"));
        }

        // Resolve ids up front so defaulted outputs can point at the next
        // operator in the list.
        let ids: Vec<String> = configs
            .iter()
            .map(|config| context.prepend_namespace(config.id().unwrap_or(config.type_name())))
            .collect();

        let mut seen = HashMap::new();
        for (index, id) in ids.iter().enumerate() {
            if let Some(_previous) = seen.insert(id.clone(), index) {
                return Err(Error::config(format!(
                    "operator with id '{id}' already exists in pipeline; ensure each operator has a unique `type` or `id`"
                )));
            }
        }

        let mut operators: Vec<Arc<dyn Operator>> = Vec::with_capacity(configs.len());
        for (index, config) in configs.iter().enumerate() {
            let default_outputs = if config.is_output() || index + 1 == configs.len() {
                Vec::new()
            } else {
                vec![ids[index + 1].clone()]
            };

            let operator = config
                .build(&context.with_default_outputs(default_outputs))
                .map_err(|err| {
                    Error::config(format!(
                        "build operator {} (type {}): {err}",
                        ids[index],
                        config.type_name()
                    ))
                })?;
            operators.push(operator);
        }

        // Resolve declared output ids to concrete operators.
        for operator in &operators {
            if operator.can_output() {
                operator.set_outputs(&operators)?;
            }
        }

        let index_of: HashMap<String, usize> = ids
            .iter()
            .enumerate()
            .map(|(index, id)| (id.clone(), index))
            .collect();

        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); operators.len()];
        for (index, operator) in operators.iter().enumerate() {
            for output in operator.output_ids() {
                let target = index_of.get(&output).ok_or_else(|| {
                    Error::config(format!(
                        "operator '{}' outputs to '{output}', which does not exist",
                        ids[index]
                    ))
                })?;
                adjacency[index].push(*target);
            }
        }

        let order = topological_order(&adjacency)
            .map_err(|cycle| Error::config(cycle_message(&ids, &cycle)))?;

        validate(&operators, &adjacency, &order)?;

        Ok(Pipeline {
            operators,
            adjacency,
            order,
        })
    }

    pub fn operators(&self) -> &[Arc<dyn Operator>] {
        &self.operators
    }

    /// Starts operators in reverse topological order: by the time inputs
    /// produce, everything downstream is ready to receive.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        for index in self.order.iter().rev() {
            let operator = &self.operators[*index];
            debug!(
                operator_id = operator.id(),
                operator_type = operator.operator_type(),
                "starting operator"
            );
            operator.start(shutdown.clone()).await.map_err(|err| {
                Error::config(format!("start operator {}: {err}", operator.id()))
            })?;
        }
        Ok(())
    }

    /// Stops operators in topological order: sources stop emitting before
    /// their consumers tear down. Failures are logged, not propagated, so
    /// every operator gets its chance to stop.
    pub async fn stop(&self) {
        for index in &self.order {
            let operator = &self.operators[*index];
            debug!(
                operator_id = operator.id(),
                operator_type = operator.operator_type(),
                "stopping operator"
            );
            if let Err(err) = operator.stop().await {
                error!(operator_id = operator.id(), %err, "failed to stop operator");
            }
        }
    }

    /// A dot-format description of the graph.
    pub fn render(&self) -> String {
        let mut out = String::from("digraph G {\n");
        for operator in &self.operators {
            let _ = writeln!(
                out,
                "  \"{}\" [type=\"{}\"];",
                operator.id(),
                operator.operator_type()
            );
        }
        for (index, successors) in self.adjacency.iter().enumerate() {
            for successor in successors {
                let _ = writeln!(
                    out,
                    "  \"{}\" -> \"{}\";",
                    self.operators[index].id(),
                    self.operators[*successor].id()
                );
            }
        }
        out.push_str("}\n");
        out
    }
}

/// Depth-first topological sort. `Err` carries one cycle, in order.
fn topological_order(adjacency: &[Vec<usize>]) -> std::result::Result<Vec<usize>, Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Unvisited,
        InProgress,
        Done,
    }

    fn visit(
        node: usize,
        adjacency: &[Vec<usize>],
        states: &mut [State],
        stack: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> std::result::Result<(), Vec<usize>> {
        match states[node] {
            State::Done => return Ok(()),
            State::InProgress => {
                let from = stack.iter().position(|n| *n == node).unwrap_or(0);
                return Err(stack[from..].to_vec());
            }
            State::Unvisited => {}
        }

        states[node] = State::InProgress;
        stack.push(node);
        for successor in &adjacency[node] {
            visit(*successor, adjacency, states, stack, order)?;
        }
        stack.pop();
        states[node] = State::Done;
        order.push(node);
        Ok(())
    }

    let mut states = vec![State::Unvisited; adjacency.len()];
    let mut order = Vec::with_capacity(adjacency.len());
    let mut stack = Vec::new();

    for node in 0..adjacency.len() {
        visit(node, adjacency, &mut states, &mut stack, &mut order)?;
    }

    // Post-order visits put successors first; reverse for inputs-first.
    order.reverse();
    Ok(order)
}

fn cycle_message(ids: &[String], cycle: &[usize]) -> String {
    let mut path: Vec<&str> = cycle.iter().map(|index| ids[*index].as_str()).collect();
    if let Some(first) = path.first().copied() {
        path.push(first);
    }
    format!(
        "pipeline has a circular dependency: {}",
        path.join(" -> ")
    )
}

/// Type conformance: every operator that is not an output must reach an
/// output, and every operator that consumes entries must be fed by some
/// input.
fn validate(
    operators: &[Arc<dyn Operator>],
    adjacency: &[Vec<usize>],
    order: &[usize],
) -> Result<()> {
    let count = operators.len();

    let mut reaches_output = vec![false; count];
    for index in order.iter().rev() {
        reaches_output[*index] = !operators[*index].can_output()
            || adjacency[*index]
                .iter()
                .any(|successor| reaches_output[*successor]);
    }

    let mut fed_by_input = vec![false; count];
    for index in order {
        if !operators[*index].can_process() {
            fed_by_input[*index] = true;
        }
        if fed_by_input[*index] {
            for successor in &adjacency[*index] {
                fed_by_input[*successor] = true;
            }
        }
    }

    for (index, operator) in operators.iter().enumerate() {
        if operator.can_output() && !reaches_output[index] {
            return Err(Error::config(format!(
                "operator '{}' has no path to an output operator",
                operator.id()
            )));
        }
        if operator.can_process() && !fed_by_input[index] {
            return Err(Error::config(format!(
                "operator '{}' is not reachable from any input operator",
                operator.id()
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests;
