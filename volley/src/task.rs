use std::{
    fmt::{self, Debug},
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::{FutureExt, future::BoxFuture};
use rand::{Rng, SeedableRng, rngs::SmallRng};

use crate::{
    error::{Error, TaskError},
    transport::{Response, Transport},
    user::UserId,
};

/// The future a task body returns.
pub type TaskFuture = BoxFuture<'static, Result<(), TaskError>>;

/// Type-erased task body.
pub type TaskBody<T> = Arc<dyn Fn(TaskContext<T>) -> TaskFuture + Send + Sync>;

/// What a task body gets to work with: the shared transport and the identity
/// of the user running it.
pub struct TaskContext<T: Transport> {
    user: UserId,
    transport: Arc<T>,
    received: Arc<AtomicU64>,
}

impl<T: Transport> TaskContext<T> {
    pub(crate) fn new(user: UserId, transport: Arc<T>, received: Arc<AtomicU64>) -> Self {
        Self {
            user,
            transport,
            received,
        }
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    /// The raw transport. Bytes received through it directly are only counted
    /// if the task reports them with [`add_received`](Self::add_received).
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Executes one request, counting the received bytes towards this task's
    /// outcome. A rejected response becomes [`TaskError::Rejected`].
    pub fn execute(
        &self,
        request: impl Into<T::Request>,
    ) -> impl Future<Output = Result<Response, TaskError>> + Send + '_ {
        let request = request.into();
        async move {
            let response = self.transport.execute(request).await?;
            self.add_received(response.bytes);
            match &response.rejection {
                Some(reason) => Err(TaskError::Rejected(reason.clone())),
                None => Ok(response),
            }
        }
    }

    pub fn add_received(&self, bytes: u64) {
        self.received.fetch_add(bytes, Ordering::Relaxed);
    }
}

impl<T: Transport> Clone for TaskContext<T> {
    fn clone(&self) -> Self {
        Self {
            user: self.user,
            transport: Arc::clone(&self.transport),
            received: Arc::clone(&self.received),
        }
    }
}

/// A named unit of work with a relative selection weight.
pub struct TaskSpec<T: Transport> {
    name: Arc<str>,
    weight: u32,
    body: TaskBody<T>,
}

impl<T: Transport> TaskSpec<T> {
    /// Creates a task from any async closure.
    ///
    /// ```rust
    /// use volley::{MockTransport, TaskSpec};
    ///
    /// let hello = TaskSpec::<MockTransport>::new("hello_world", 1, |ctx| async move {
    ///     ctx.execute("/hello").await?;
    ///     ctx.execute("/world").await?;
    ///     Ok(())
    /// });
    /// assert_eq!(hello.name(), "hello_world");
    /// ```
    pub fn new<F, Fut>(name: impl Into<Arc<str>>, weight: u32, body: F) -> Self
    where
        F: Fn(TaskContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            weight,
            body: Arc::new(move |ctx| body(ctx).boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub(crate) fn execute(&self, ctx: TaskContext<T>) -> TaskFuture {
        (self.body)(ctx)
    }
}

impl<T: Transport> Clone for TaskSpec<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            weight: self.weight,
            body: Arc::clone(&self.body),
        }
    }
}

impl<T: Transport> Debug for TaskSpec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}

/// How a [`TaskSet`] picks the next task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Selection {
    /// Random, proportional to each task's weight. A task may repeat immediately.
    #[default]
    Weighted,
    /// Declaration order, wrapping around. Weights are ignored.
    Sequential,
}

/// Per-user selection state: the random source and the sequential position.
#[derive(Debug, Clone)]
pub struct TaskCursor {
    rng: SmallRng,
    position: usize,
}

impl TaskCursor {
    /// A cursor with a reproducible random sequence.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            position: 0,
        }
    }

    /// A cursor seeded from the operating system.
    pub fn from_entropy() -> Self {
        Self {
            rng: SmallRng::from_os_rng(),
            position: 0,
        }
    }

    pub fn rng_mut(&mut self) -> &mut SmallRng {
        &mut self.rng
    }
}

/// The immutable collection of tasks a simulated user draws from.
///
/// Shared read-only between all users of a run.
pub struct TaskSet<T: Transport> {
    tasks: Vec<TaskSpec<T>>,
    /// `cumulative[i]` is the sum of the weights of tasks `0..=i`.
    cumulative: Vec<u64>,
    selection: Selection,
}

impl<T: Transport> TaskSet<T> {
    pub fn new(tasks: Vec<TaskSpec<T>>, selection: Selection) -> Result<Self, Error> {
        if tasks.is_empty() {
            return Err(Error::EmptyTaskSet);
        }

        let mut cumulative = Vec::with_capacity(tasks.len());
        let mut total = 0u64;
        for task in &tasks {
            if task.weight == 0 {
                return Err(Error::InvalidTask {
                    name: task.name().to_string(),
                    reason: "weight must be positive".to_string(),
                });
            }
            total += u64::from(task.weight);
            cumulative.push(total);
        }

        Ok(Self {
            tasks,
            cumulative,
            selection,
        })
    }

    pub fn weighted(tasks: Vec<TaskSpec<T>>) -> Result<Self, Error> {
        Self::new(tasks, Selection::Weighted)
    }

    pub fn sequential(tasks: Vec<TaskSpec<T>>) -> Result<Self, Error> {
        Self::new(tasks, Selection::Sequential)
    }

    /// Picks the task to run next.
    pub fn next_task(&self, cursor: &mut TaskCursor) -> &TaskSpec<T> {
        let index = match self.selection {
            Selection::Weighted => {
                let pick = cursor.rng.random_range(0..self.total_weight());
                self.cumulative.partition_point(|&c| c <= pick)
            }
            Selection::Sequential => {
                let index = cursor.position % self.tasks.len();
                cursor.position = cursor.position.wrapping_add(1);
                index
            }
        };
        &self.tasks[index]
    }

    pub fn total_weight(&self) -> u64 {
        self.cumulative.last().copied().unwrap_or(0)
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    pub fn tasks(&self) -> &[TaskSpec<T>] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl<T: Transport> Debug for TaskSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSet")
            .field("tasks", &self.tasks)
            .field("selection", &self.selection)
            .finish()
    }
}
