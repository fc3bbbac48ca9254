//! Plan-scoped predicate queries.
//!
//! A [`TaskMatcher`] is a composable predicate over tasks; combinators
//! `and`, `or` and `negate` build the predicate tree, and
//! [`Plan::find_tasks`] evaluates it. Inside a transaction the query
//! scope picks between the merged view ([`QueryScope::Global`]) and the
//! wrapped objects only ([`QueryScope::Local`]).

use crate::plan::Plan;
use crate::task::Task;
use crate::transaction::Transaction;
use serde_json::Value;
use warden_types::{ModelId, TaskId};

/// Which layer of a transaction stack a query resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryScope {
    /// The virtual plan: base plan plus staged mutations.
    Global,
    /// The transaction's own proxies only.
    Local,
}

#[derive(Clone)]
enum Pred {
    Any,
    Mission,
    Permanent,
    Pending,
    Running,
    Finished,
    Failed,
    FailedToStart,
    Abstract,
    Reusable,
    WithModel(ModelId),
    WithArgument(String, Value),
    And(Box<Pred>, Box<Pred>),
    Or(Box<Pred>, Box<Pred>),
    Not(Box<Pred>),
}

impl Pred {
    fn eval(&self, plan: &Plan, task: &Task) -> bool {
        match self {
            Self::Any => true,
            Self::Mission => plan.is_mission(task.id()),
            Self::Permanent => plan.permanent_tasks().contains(&task.id()),
            Self::Pending => task.state().pending,
            Self::Running => task.state().running,
            Self::Finished => task.state().finished,
            Self::Failed => task.state().failed(),
            Self::FailedToStart => task.state().failed_to_start,
            Self::Abstract => task.is_abstract(),
            Self::Reusable => task.reusable(),
            Self::WithModel(id) => task.model().fullfills_id(*id),
            Self::WithArgument(name, value) => task.arguments().get(name) == Some(value),
            Self::And(a, b) => a.eval(plan, task) && b.eval(plan, task),
            Self::Or(a, b) => a.eval(plan, task) || b.eval(plan, task),
            Self::Not(inner) => !inner.eval(plan, task),
        }
    }
}

/// A composable task predicate.
///
/// # Example
///
/// ```
/// use warden_plan::{Plan, TaskMatcher};
/// use warden_model::TaskModel;
///
/// let mut plan = Plan::new();
/// let model = TaskModel::builder("goto").build().unwrap();
/// let t = plan.add_task(&model, vec![]).unwrap();
/// plan.add_mission_task(t).unwrap();
///
/// let matcher = TaskMatcher::mission().and(TaskMatcher::pending());
/// assert_eq!(plan.find_tasks(&matcher), vec![t]);
///
/// let none = TaskMatcher::mission().negate();
/// assert!(plan.find_tasks(&none).is_empty());
/// ```
#[derive(Clone)]
pub struct TaskMatcher(Pred);

impl TaskMatcher {
    /// Matches every task.
    #[must_use]
    pub fn any() -> Self {
        Self(Pred::Any)
    }

    /// Matches mission tasks.
    #[must_use]
    pub fn mission() -> Self {
        Self(Pred::Mission)
    }

    /// Matches permanent tasks.
    #[must_use]
    pub fn permanent() -> Self {
        Self(Pred::Permanent)
    }

    /// Matches pending tasks.
    #[must_use]
    pub fn pending() -> Self {
        Self(Pred::Pending)
    }

    /// Matches running tasks.
    #[must_use]
    pub fn running() -> Self {
        Self(Pred::Running)
    }

    /// Matches finished tasks.
    #[must_use]
    pub fn finished() -> Self {
        Self(Pred::Finished)
    }

    /// Matches failed tasks (failure outcome or failed-to-start).
    #[must_use]
    pub fn failed() -> Self {
        Self(Pred::Failed)
    }

    /// Matches failed-to-start tasks.
    #[must_use]
    pub fn failed_to_start() -> Self {
        Self(Pred::FailedToStart)
    }

    /// Matches abstract tasks.
    #[must_use]
    pub fn abstract_tasks() -> Self {
        Self(Pred::Abstract)
    }

    /// Matches tasks a planning layer may reuse.
    #[must_use]
    pub fn reusable() -> Self {
        Self(Pred::Reusable)
    }

    /// Matches tasks whose model fullfills `model`.
    #[must_use]
    pub fn with_model(model: ModelId) -> Self {
        Self(Pred::WithModel(model))
    }

    /// Matches tasks with the given concrete argument value.
    #[must_use]
    pub fn with_argument(name: &str, value: Value) -> Self {
        Self(Pred::WithArgument(name.to_string(), value))
    }

    /// Both predicates must hold.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self(Pred::And(Box::new(self.0), Box::new(other.0)))
    }

    /// Either predicate may hold.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self(Pred::Or(Box::new(self.0), Box::new(other.0)))
    }

    /// Inverts the predicate.
    #[must_use]
    pub fn negate(self) -> Self {
        Self(Pred::Not(Box::new(self.0)))
    }

    /// Evaluates the predicate on one task.
    #[must_use]
    pub fn matches(&self, plan: &Plan, task: &Task) -> bool {
        self.0.eval(plan, task)
    }
}

impl Plan {
    /// Ids of the tasks satisfying `matcher`, ascending.
    #[must_use]
    pub fn find_tasks(&self, matcher: &TaskMatcher) -> Vec<TaskId> {
        self.task_ids()
            .into_iter()
            .filter(|id| {
                self.task(*id)
                    .is_some_and(|task| matcher.matches(self, task))
            })
            .collect()
    }

    /// Yields every task satisfying `matcher`, in id order.
    pub fn each_task_matching<'a>(
        &'a self,
        matcher: &'a TaskMatcher,
    ) -> impl Iterator<Item = &'a Task> {
        self.find_tasks(matcher)
            .into_iter()
            .filter_map(move |id| self.task(id))
    }
}

impl Transaction {
    /// Evaluates a query inside the transaction.
    ///
    /// `Global` resolves against the virtual plan (base tasks minus
    /// staged removals; tasks staged in the transaction join the query
    /// space at commit). `Local` resolves against the wrapped proxies
    /// only.
    #[must_use]
    pub fn find_tasks(
        &self,
        plan: &Plan,
        matcher: &TaskMatcher,
        scope: QueryScope,
    ) -> Vec<TaskId> {
        plan.find_tasks(matcher)
            .into_iter()
            .filter(|id| match scope {
                QueryScope::Global => !self.is_removed(*id),
                QueryScope::Local => self.wrapped_tasks().contains(id),
            })
            .collect()
    }
}
