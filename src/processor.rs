//! Asynchronous item processors and their combinators
//!
//! An [`ItemProcessor`] consumes one item and produces a future result. It may
//! be invoked for many items without waiting for earlier invocations to
//! settle. Processors compose by wrapping: every combinator in
//! [`ItemProcessorExt`] returns a new processor delegating to its operands.

use async_trait::async_trait;
use futures::future::join_all;
use futures_util::FutureExt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::error::{flatten_panic, FlowResult};
use crate::sparse::SparseSeq;

/// An async processor of items.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// Type of processing input
    type Item: Send + 'static;
    /// Type of processing result
    type Output: Send + 'static;

    /// Invoked once before processing begins. `process` calls are issued only
    /// after this resolves successfully.
    async fn prepare(&self) -> FlowResult<()> {
        Ok(())
    }

    /// Process the next available item. Multiple calls can be issued without
    /// waiting for previously returned futures to resolve.
    async fn process(&self, item: Self::Item) -> FlowResult<Self::Output>;

    /// Identity used in log lines.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A shareable, type-erased processor
pub type BoxProcessor<T, R> = Arc<dyn ItemProcessor<Item = T, Output = R>>;

#[async_trait]
impl<P> ItemProcessor for Arc<P>
where
    P: ItemProcessor + ?Sized,
{
    type Item = P::Item;
    type Output = P::Output;

    async fn prepare(&self) -> FlowResult<()> {
        (**self).prepare().await
    }

    async fn process(&self, item: Self::Item) -> FlowResult<Self::Output> {
        (**self).process(item).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

// ================================
// Leaf processors
// ================================

/// Processor completing immediately with its own input.
pub struct Completed<T> {
    _item: PhantomData<fn(T) -> T>,
}

/// Returns a processor which is already completed with its input. Useful as
/// the head of a composition chain.
pub fn completed_processor<T>() -> Completed<T>
where
    T: Send + 'static,
{
    Completed { _item: PhantomData }
}

#[async_trait]
impl<T> ItemProcessor for Completed<T>
where
    T: Send + 'static,
{
    type Item = T;
    type Output = T;

    async fn process(&self, item: T) -> FlowResult<T> {
        Ok(item)
    }

    fn name(&self) -> &str {
        "completed"
    }
}

/// Processor backed by an async function.
pub struct ProcessorFn<F, T> {
    f: F,
    _item: PhantomData<fn(T)>,
}

/// Lift an async function into an [`ItemProcessor`].
pub fn processor_fn<T, F, Fut, R>(f: F) -> ProcessorFn<F, T>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FlowResult<R>> + Send + 'static,
    R: Send + 'static,
{
    ProcessorFn {
        f,
        _item: PhantomData,
    }
}

#[async_trait]
impl<T, F, Fut, R> ItemProcessor for ProcessorFn<F, T>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FlowResult<R>> + Send + 'static,
    R: Send + 'static,
{
    type Item = T;
    type Output = R;

    async fn process(&self, item: T) -> FlowResult<R> {
        (self.f)(item).await
    }
}

// ================================
// Combinators
// ================================

/// See [`ItemProcessorExt::apply`].
pub struct Apply<P, F> {
    inner: P,
    mapper: F,
}

#[async_trait]
impl<P, F, V> ItemProcessor for Apply<P, F>
where
    P: ItemProcessor,
    F: Fn(P::Output) -> V + Send + Sync,
    V: Send + 'static,
{
    type Item = P::Item;
    type Output = V;

    async fn prepare(&self) -> FlowResult<()> {
        self.inner.prepare().await
    }

    async fn process(&self, item: P::Item) -> FlowResult<V> {
        let result = self.inner.process(item).await?;
        Ok((self.mapper)(result))
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// See [`ItemProcessorExt::apply_with_input`].
pub struct ApplyWithInput<P, F> {
    inner: P,
    mapper: F,
}

#[async_trait]
impl<P, F, V> ItemProcessor for ApplyWithInput<P, F>
where
    P: ItemProcessor,
    P::Item: Clone,
    F: Fn(P::Item, P::Output) -> V + Send + Sync,
    V: Send + 'static,
{
    type Item = P::Item;
    type Output = V;

    async fn prepare(&self) -> FlowResult<()> {
        self.inner.prepare().await
    }

    async fn process(&self, item: P::Item) -> FlowResult<V> {
        let input = item.clone();
        let result = self.inner.process(item).await?;
        Ok((self.mapper)(input, result))
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// See [`ItemProcessorExt::compose_async_optionally`].
pub struct ComposeAsync<P, A, C> {
    inner: P,
    after: Arc<A>,
    predicate: C,
}

#[async_trait]
impl<P, A, C> ItemProcessor for ComposeAsync<P, A, C>
where
    P: ItemProcessor,
    P::Output: Clone,
    A: ItemProcessor<Item = P::Output> + 'static,
    C: Fn(&P::Output) -> bool + Send + Sync,
{
    type Item = P::Item;
    type Output = P::Output;

    async fn prepare(&self) -> FlowResult<()> {
        self.inner.prepare().await?;
        self.after.prepare().await
    }

    async fn process(&self, item: P::Item) -> FlowResult<P::Output> {
        let result = self.inner.process(item).await?;
        if (self.predicate)(&result) {
            let after = Arc::clone(&self.after);
            let input = result.clone();
            tokio::spawn(async move {
                let outcome = AssertUnwindSafe(after.process(input)).catch_unwind().await;
                if let Err(e) = flatten_panic(outcome) {
                    log::error!("Side-channel processor {} failed: {}", after.name(), e);
                }
            });
        }
        Ok(result)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// See [`ItemProcessorExt::compose`].
pub struct Compose<P, A> {
    inner: P,
    after: A,
}

#[async_trait]
impl<P, A> ItemProcessor for Compose<P, A>
where
    P: ItemProcessor,
    A: ItemProcessor<Item = P::Output>,
{
    type Item = P::Item;
    type Output = A::Output;

    async fn prepare(&self) -> FlowResult<()> {
        self.inner.prepare().await?;
        self.after.prepare().await
    }

    async fn process(&self, item: P::Item) -> FlowResult<A::Output> {
        let result = self.inner.process(item).await?;
        self.after.process(result).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// See [`ItemProcessorExt::compose_optionally`].
pub struct ComposeOptionally<P, A, C> {
    inner: P,
    after: A,
    predicate: C,
}

#[async_trait]
impl<P, A, C> ItemProcessor for ComposeOptionally<P, A, C>
where
    P: ItemProcessor,
    A: ItemProcessor<Item = P::Output>,
    C: Fn(&P::Output) -> bool + Send + Sync,
{
    type Item = P::Item;
    type Output = Option<A::Output>;

    async fn prepare(&self) -> FlowResult<()> {
        self.inner.prepare().await?;
        self.after.prepare().await
    }

    async fn process(&self, item: P::Item) -> FlowResult<Option<A::Output>> {
        let result = self.inner.process(item).await?;
        if (self.predicate)(&result) {
            self.after.process(result).await.map(Some)
        } else {
            Ok(None)
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// See [`aggregate_processor`].
pub struct Aggregate<P> {
    inner: P,
}

/// Lift a single-item processor into one processing every present entry of a
/// [`SparseSeq`] concurrently.
///
/// The result keeps the input's positions: a slot holds the inner result where
/// processing succeeded, and is absent where it failed or was already absent.
/// Individual failures are logged and never fail the aggregate.
pub fn aggregate_processor<P>(inner: P) -> Aggregate<P>
where
    P: ItemProcessor,
{
    Aggregate { inner }
}

#[async_trait]
impl<P> ItemProcessor for Aggregate<P>
where
    P: ItemProcessor,
{
    type Item = SparseSeq<P::Item>;
    type Output = SparseSeq<P::Output>;

    async fn prepare(&self) -> FlowResult<()> {
        self.inner.prepare().await
    }

    async fn process(&self, items: SparseSeq<P::Item>) -> FlowResult<SparseSeq<P::Output>> {
        let presence = items.presence();
        let settled = join_all(items.into_iter().map(|item| {
            AssertUnwindSafe(self.inner.process(item))
                .catch_unwind()
                .map(flatten_panic::<P::Output>)
        }))
        .await;

        let name = self.inner.name();
        Ok(presence.replace_optional(settled.into_iter().map(|r| match r {
            Ok(value) => Some(value),
            Err(e) => {
                log::error!("Aggregate processing failure in {}: {}", name, e);
                None
            }
        })))
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

fn always<T>(_: &T) -> bool {
    true
}

/// Composition operators available on every [`ItemProcessor`]
pub trait ItemProcessorExt: ItemProcessor + Sized {
    /// Map the successful result. Failures pass through unchanged.
    fn apply<F, V>(self, mapper: F) -> Apply<Self, F>
    where
        F: Fn(Self::Output) -> V + Send + Sync,
        V: Send + 'static,
    {
        Apply {
            inner: self,
            mapper,
        }
    }

    /// Map the successful result together with the item that produced it.
    fn apply_with_input<F, V>(self, mapper: F) -> ApplyWithInput<Self, F>
    where
        Self::Item: Clone,
        F: Fn(Self::Item, Self::Output) -> V + Send + Sync,
        V: Send + 'static,
    {
        ApplyWithInput {
            inner: self,
            mapper,
        }
    }

    /// Trigger `after` with this processor's result without awaiting it.
    fn compose_async<A>(self, after: A) -> ComposeAsync<Self, A, fn(&Self::Output) -> bool>
    where
        Self::Output: Clone,
        A: ItemProcessor<Item = Self::Output> + 'static,
    {
        self.compose_async_optionally(always::<Self::Output> as fn(&Self::Output) -> bool, after)
    }

    /// Trigger `after` when `predicate` holds for this processor's result.
    ///
    /// The returned processor resolves with this processor's own result as
    /// soon as it is available. `after` runs detached; its result is dropped
    /// and its failures are only logged.
    fn compose_async_optionally<C, A>(self, predicate: C, after: A) -> ComposeAsync<Self, A, C>
    where
        Self::Output: Clone,
        A: ItemProcessor<Item = Self::Output> + 'static,
        C: Fn(&Self::Output) -> bool + Send + Sync,
    {
        ComposeAsync {
            inner: self,
            after: Arc::new(after),
            predicate,
        }
    }

    /// Feed this processor's result into `after`, resolving with `after`'s result.
    fn compose<A>(self, after: A) -> Compose<Self, A>
    where
        A: ItemProcessor<Item = Self::Output>,
    {
        Compose { inner: self, after }
    }

    /// Feed this processor's result into `after` when `predicate` holds,
    /// resolving with `Some(result of after)`, or `None` when skipped.
    fn compose_optionally<C, A>(self, predicate: C, after: A) -> ComposeOptionally<Self, A, C>
    where
        A: ItemProcessor<Item = Self::Output>,
        C: Fn(&Self::Output) -> bool + Send + Sync,
    {
        ComposeOptionally {
            inner: self,
            after,
            predicate,
        }
    }

    fn boxed(self) -> BoxProcessor<Self::Item, Self::Output>
    where
        Self: 'static,
    {
        Arc::new(self)
    }
}

impl<P> ItemProcessorExt for P where P: ItemProcessor {}
