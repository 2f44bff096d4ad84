//! The execution graph: dependency edges, cycle detection and layered
//! topological scheduling.

use crate::{
    error::{Result, StrataError},
    job::Job,
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

/// A graph vertex wrapping one executable job.
///
/// `parents` must complete before this node; `children` transitively depend
/// on it. Both lists are duplicate-free and kept symmetric: for every edge
/// `p -> c`, `p` appears in `c.parents` and `c` in `p.children`.
#[derive(Debug)]
pub struct ExecutionNode {
    job: Arc<Job>,
    parents: Vec<usize>,
    children: Vec<usize>,
}

impl ExecutionNode {
    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    pub fn parents(&self) -> &[usize] {
        &self.parents
    }

    pub fn children(&self) -> &[usize] {
        &self.children
    }
}

/// An ordered set of jobs with no dependencies among each other; safe to run
/// concurrently.
#[derive(Clone, Debug)]
pub struct ExecutionLayer {
    jobs: Vec<Arc<Job>>,
}

impl ExecutionLayer {
    pub fn jobs(&self) -> &[Arc<Job>] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Canonical job ids of this layer, useful for assertions and events.
    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.iter().map(|job| job.id().to_string()).collect()
    }
}

/// A dependency graph over jobs, closed under transitive dependencies at
/// attach time so layer computation is a single Kahn pass.
#[derive(Debug, Default)]
pub struct ExecutionGraph {
    nodes: Vec<ExecutionNode>,
    index: HashMap<String, usize>,
}

impl ExecutionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, job_id: &str) -> Option<&ExecutionNode> {
        self.index.get(job_id).map(|&i| &self.nodes[i])
    }

    fn ensure_node(&mut self, job: &Arc<Job>) -> usize {
        let id = job.id().to_string();
        if let Some(&index) = self.index.get(&id) {
            return index;
        }
        let index = self.nodes.len();
        self.nodes.push(ExecutionNode {
            job: job.clone(),
            parents: Vec::new(),
            children: Vec::new(),
        });
        self.index.insert(id, index);
        index
    }

    /// Inserts the edge `parent -> child` once, keeping both lists
    /// duplicate-free.
    fn link(&mut self, parent: usize, child: usize) {
        if !self.nodes[child].parents.contains(&parent) {
            self.nodes[child].parents.push(parent);
            self.nodes[parent].children.push(child);
        }
    }

    /// Attaches `deps` as prerequisites of `main`.
    ///
    /// Each dependency becomes a parent of `main` and a transitive ancestor
    /// of every already-known descendant of `main`; symmetrically, `main`
    /// and its descendants are propagated into the dependency's
    /// descendants.
    pub fn attach(&mut self, main: &Arc<Job>, deps: &[Arc<Job>]) {
        let main_index = self.ensure_node(main);
        for dep in deps {
            let dep_index = self.ensure_node(dep);
            let descendants = self.nodes[main_index].children.clone();
            self.link(dep_index, main_index);
            for descendant in descendants {
                self.link(dep_index, descendant);
            }
        }
    }

    /// Computes the parallel execution layers for `target_job_id`.
    ///
    /// The layers cover exactly the target's ancestor set (target included);
    /// a job appears in a later layer than all of its in-scope parents.
    pub fn execution_layers(&self, target_job_id: &str) -> Result<Vec<ExecutionLayer>> {
        let target = *self
            .index
            .get(target_job_id)
            .ok_or_else(|| StrataError::UnknownJob(target_job_id.to_string()))?;

        // the ancestor set, including the target itself
        let mut ancestors = HashSet::new();
        let mut queue = VecDeque::from([target]);
        while let Some(node) = queue.pop_front() {
            if ancestors.insert(node) {
                queue.extend(self.nodes[node].parents.iter().copied());
            }
        }

        // in-degrees restricted to the ancestor set
        let mut in_degrees: HashMap<usize, usize> = ancestors
            .iter()
            .map(|&node| {
                let degree =
                    self.nodes[node].parents.iter().filter(|p| ancestors.contains(p)).count();
                (node, degree)
            })
            .collect();

        let mut frontier: Vec<usize> =
            ancestors.iter().copied().filter(|node| in_degrees[node] == 0).collect();
        frontier.sort_unstable();

        let mut layers = Vec::new();
        let mut processed = 0usize;
        while !frontier.is_empty() {
            processed += frontier.len();
            let mut next = Vec::new();
            for &node in &frontier {
                for &child in &self.nodes[node].children {
                    if let Some(degree) = in_degrees.get_mut(&child) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(child);
                        }
                    }
                }
            }
            next.sort_unstable();
            next.dedup();
            layers.push(ExecutionLayer {
                jobs: frontier.iter().map(|&node| self.nodes[node].job.clone()).collect(),
            });
            frontier = next;
        }

        if processed != ancestors.len() {
            return Err(StrataError::CycleDetected(target_job_id.to_string()));
        }
        Ok(layers)
    }

    /// Computes the layers for `target_job_id` and rides eligible background
    /// jobs onto them.
    ///
    /// A background job that is not itself an ancestor of the target still
    /// starts when every one of its parents is scheduled: it joins the layer
    /// after its deepest parent. This is what lets a fire-and-forget job
    /// piggyback on a build without gating any layer boundary.
    pub fn execution_plan(&self, target_job_id: &str) -> Result<Vec<ExecutionLayer>> {
        let mut layers = self.execution_layers(target_job_id)?;

        let mut layer_of: HashMap<usize, usize> = HashMap::new();
        for (layer_index, layer) in layers.iter().enumerate() {
            for job in layer.jobs() {
                if let Some(&node) = self.index.get(&job.id().to_string()) {
                    layer_of.insert(node, layer_index);
                }
            }
        }

        let mut riders: Vec<(usize, usize)> = Vec::new();
        for (node_index, node) in self.nodes.iter().enumerate() {
            if node.job.is_blocking() || layer_of.contains_key(&node_index) {
                continue;
            }
            let parent_layers: Option<Vec<usize>> = node
                .parents
                .iter()
                .map(|parent| layer_of.get(parent).copied())
                .collect();
            match parent_layers {
                Some(parents) if !parents.is_empty() => {
                    let layer = parents.into_iter().max().unwrap_or(0) + 1;
                    riders.push((layer, node_index));
                }
                _ => {}
            }
        }
        for (layer, node_index) in riders {
            let job = self.nodes[node_index].job.clone();
            if layer < layers.len() {
                layers[layer].jobs.push(job);
            } else {
                layers.push(ExecutionLayer { jobs: vec![job] });
            }
        }
        Ok(layers)
    }

    /// Renders the current graph as a mermaid flowchart for diagnostics.
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("flowchart TD\n");
        for (index, node) in self.nodes.iter().enumerate() {
            out.push_str(&format!("    n{index}[\"{}\"]\n", node.job.id()));
        }
        for (index, node) in self.nodes.iter().enumerate() {
            for &child in &node.children {
                out.push_str(&format!("    n{index} --> n{child}\n"));
            }
        }
        out
    }
}
