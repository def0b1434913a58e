//! Discovery of the component chain hanging off one or more roots
//!
//! Traversal follows output port -> connection -> input port edges depth
//! first. Unconnected outputs are where data leaves the chain and needs a
//! consumer; unconnected inputs are where data may be fed in.

use std::collections::HashSet;

use super::component::Component;
use super::connection::Connection;
use super::native::ComponentId;
use super::port::Port;

/// Components, tunnels and open ports reachable from a set of roots
#[derive(Debug, Default)]
pub struct PipelineGraph {
    components: Vec<Component>,
    connections: Vec<Connection>,
    open_outputs: Vec<Port>,
    open_inputs: Vec<Port>,
}

impl PipelineGraph {
    /// Walk downstream from every root. Each component appears once, in
    /// discovery order, even when several roots reach it.
    pub fn discover(roots: &[Component]) -> Self {
        let mut graph = PipelineGraph::default();
        let mut visited = HashSet::new();
        for root in roots {
            graph.visit(root, &mut visited);
        }
        graph
    }

    fn visit(&mut self, component: &Component, visited: &mut HashSet<ComponentId>) {
        if !visited.insert(component.id()) {
            return;
        }
        self.components.push(component.clone());

        for input in component.inputs() {
            if !input.is_tunnelled() {
                self.open_inputs.push(input.clone());
            }
        }

        let mut downstream = Vec::new();
        for output in component.outputs() {
            match output.connection() {
                Some(connection) => {
                    if let Some(next) = connection.sink().component() {
                        downstream.push(next);
                    }
                    self.connections.push(connection);
                }
                None => self.open_outputs.push(output.clone()),
            }
        }

        for next in &downstream {
            self.visit(next, visited);
        }
    }

    /// Every component in discovery order
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// Tunnels between discovered components, upstream first
    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Outputs with no tunnel; data leaves the chain here
    pub fn open_outputs(&self) -> &[Port] {
        &self.open_outputs
    }

    /// Inputs with no tunnel; data can be fed in here
    pub fn open_inputs(&self) -> &[Port] {
        &self.open_inputs
    }

    /// Components with at least one unconnected output
    pub fn terminals(&self) -> Vec<&Component> {
        self.components
            .iter()
            .filter(|component| component.outputs().iter().any(|port| !port.is_tunnelled()))
            .collect()
    }

    /// Whether `port` belongs to a discovered component
    pub fn contains(&self, port: &Port) -> bool {
        self.components
            .iter()
            .any(|component| component.ports().any(|candidate| candidate.same_as(port)))
    }
}
