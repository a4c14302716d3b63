//! The task DAG submitted as one job.

use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use crate::task::Task;

/// A directed acyclic graph of tasks plus the declarations of which tasks
/// consume the job's initial inputs and which produce its results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskGraph {
    tasks: HashMap<Uuid, Task>,
    dependencies: Vec<(Uuid, Uuid)>,
    input_tasks: Vec<Uuid>,
    output_tasks: Vec<Uuid>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task. Returns false if a task with the same id already exists.
    pub fn add_task(&mut self, task: Task) -> bool {
        if self.tasks.contains_key(&task.id) {
            return false;
        }
        self.tasks.insert(task.id, task);
        true
    }

    /// Adds a task together with its parent edges. Returns false if the task
    /// already exists or any parent is unknown.
    pub fn add_child_task(&mut self, task: Task, parents: &[Uuid]) -> bool {
        if parents.iter().any(|p| !self.tasks.contains_key(p)) {
            return false;
        }
        let task_id = task.id;
        if !self.add_task(task) {
            return false;
        }
        for parent in parents {
            self.dependencies.push((*parent, task_id));
        }
        true
    }

    pub fn add_dependency(&mut self, parent: Uuid, child: Uuid) {
        self.dependencies.push((parent, child));
    }

    pub fn task(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn task_mut(&mut self, id: Uuid) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    pub fn tasks(&self) -> &HashMap<Uuid, Task> {
        &self.tasks
    }

    pub fn dependencies(&self) -> &[(Uuid, Uuid)] {
        &self.dependencies
    }

    pub fn child_tasks(&self, id: Uuid) -> Vec<Uuid> {
        self.dependencies
            .iter()
            .filter(|(parent, _)| *parent == id)
            .map(|(_, child)| *child)
            .collect()
    }

    pub fn parent_tasks(&self, id: Uuid) -> Vec<Uuid> {
        self.dependencies
            .iter()
            .filter(|(_, child)| *child == id)
            .map(|(parent, _)| *parent)
            .collect()
    }

    /// Tasks with no parents within this graph.
    pub fn head_tasks(&self) -> Vec<Uuid> {
        let children: HashSet<Uuid> = self.dependencies.iter().map(|(_, c)| *c).collect();
        self.tasks
            .keys()
            .filter(|id| !children.contains(id))
            .copied()
            .collect()
    }

    pub fn add_input_task(&mut self, id: Uuid) {
        self.input_tasks.push(id);
    }

    pub fn add_output_task(&mut self, id: Uuid) {
        self.output_tasks.push(id);
    }

    pub fn input_tasks(&self) -> &[Uuid] {
        &self.input_tasks
    }

    pub fn output_tasks(&self) -> &[Uuid] {
        &self.output_tasks
    }

    /// An insertion order in which every task appears after all of its
    /// parents, or `None` when the graph has a cycle or a dangling edge.
    pub fn topological_order(&self) -> Option<Vec<Uuid>> {
        if self
            .dependencies
            .iter()
            .any(|(p, c)| !self.tasks.contains_key(p) || !self.tasks.contains_key(c))
        {
            return None;
        }

        let mut order = Vec::with_capacity(self.tasks.len());
        let mut inserted: HashSet<Uuid> = HashSet::new();
        let mut queue: VecDeque<Uuid> = self.head_tasks().into();

        while let Some(task_id) = queue.pop_front() {
            if inserted.contains(&task_id) {
                continue;
            }
            if !self
                .parent_tasks(task_id)
                .iter()
                .all(|parent| inserted.contains(parent))
            {
                continue;
            }
            inserted.insert(task_id);
            order.push(task_id);
            for child in self.child_tasks(task_id) {
                if self
                    .parent_tasks(child)
                    .iter()
                    .all(|parent| inserted.contains(parent))
                {
                    queue.push_back(child);
                }
            }
        }

        if order.len() == self.tasks.len() {
            Some(order)
        } else {
            None
        }
    }

    /// Re-mints every task id, rewiring dependencies, producer references,
    /// and input/output declarations. Used to retry a submission that hit a
    /// duplicate key.
    pub fn reset_ids(&mut self) {
        let id_map: HashMap<Uuid, Uuid> = self
            .tasks
            .keys()
            .map(|old| (*old, Uuid::new_v4()))
            .collect();

        let mut new_tasks = HashMap::with_capacity(self.tasks.len());
        for (old_id, mut task) in self.tasks.drain() {
            let new_id = id_map[&old_id];
            task.id = new_id;
            for input in &mut task.inputs {
                if let Some((producer, position)) = input.output_source {
                    input.output_source = Some((id_map[&producer], position));
                }
            }
            new_tasks.insert(new_id, task);
        }
        self.tasks = new_tasks;

        for (parent, child) in &mut self.dependencies {
            *parent = id_map[parent];
            *child = id_map[child];
        }
        for id in &mut self.input_tasks {
            *id = id_map[id];
        }
        for id in &mut self.output_tasks {
            *id = id_map[id];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskInput;

    fn chain_graph() -> (TaskGraph, Uuid, Uuid, Uuid) {
        let mut graph = TaskGraph::new();
        let a = Task::new("a");
        let b = Task::new("b");
        let c = Task::new("c");
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        graph.add_task(a);
        graph.add_child_task(b, &[a_id]);
        graph.add_child_task(c, &[b_id]);
        (graph, a_id, b_id, c_id)
    }

    #[test]
    fn topological_order_respects_edges() {
        let (graph, a, b, c) = chain_graph();
        let order = graph.topological_order().unwrap();
        assert_eq!(order, vec![a, b, c]);
    }

    #[test]
    fn cycle_has_no_order() {
        let (mut graph, a, _, c) = chain_graph();
        graph.add_dependency(c, a);
        assert!(graph.topological_order().is_none());
    }

    #[test]
    fn dangling_edge_has_no_order() {
        let (mut graph, _, _, c) = chain_graph();
        graph.add_dependency(Uuid::new_v4(), c);
        assert!(graph.topological_order().is_none());
    }

    #[test]
    fn reset_ids_rewires_producer_references() {
        let mut graph = TaskGraph::new();
        let producer = Task::new("p");
        let producer_id = producer.id;
        let mut consumer = Task::new("c");
        consumer.add_input(TaskInput::from_output(producer_id, 0, "int"));
        let consumer_id = consumer.id;
        graph.add_task(producer);
        graph.add_child_task(consumer, &[producer_id]);
        graph.add_input_task(producer_id);
        graph.add_output_task(consumer_id);

        graph.reset_ids();

        assert!(graph.task(producer_id).is_none());
        assert_eq!(graph.tasks().len(), 2);
        let new_producer = graph.input_tasks()[0];
        let new_consumer = graph.output_tasks()[0];
        assert_eq!(graph.dependencies(), &[(new_producer, new_consumer)]);
        let consumer = graph.task(new_consumer).unwrap();
        assert_eq!(consumer.inputs[0].output_source, Some((new_producer, 0)));
    }
}
