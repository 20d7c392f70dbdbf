//! Scope-local context propagation.
//!
//! A scope overlays extra context onto every envelope emitted inside it,
//! without the caller threading anything explicitly. Two backends:
//!
//! - [`ScopeBackend::TaskLocal`] — `tokio::task_local!` frame storage.
//!   Scopes follow the future across `.await` points and work-stealing
//!   thread migration. This is the correctness floor for concurrent hosts.
//! - [`ScopeBackend::ThreadStack`] — a `thread_local!` stack of frames.
//!   Correct for synchronous code and for async code that does not cross a
//!   suspension point between scope entry and the emit site. Concurrent
//!   scopes interleaving on one thread can observe each other's frames,
//!   and a future migrating threads strands its frame; both are accepted
//!   limitations of the fallback, not bugs to fix.
//!
//! The backend is selected once at facade construction.

use std::cell::RefCell;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::envelope::Ctx;

tokio::task_local! {
    static TASK_SCOPE: Ctx;
}

thread_local! {
    static STACK_SCOPE: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
struct Frame {
    id: u64,
    ctx: Ctx,
}

/// Which storage mechanism backs scope propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScopeBackend {
    /// `tokio::task_local!` storage; survives `.await` and thread migration.
    #[default]
    TaskLocal,
    /// `thread_local!` stack; synchronous-code fallback.
    ThreadStack,
}

/// Handle to the scope-local context layer.
///
/// Entering a scope merges the given context onto the current effective
/// scope, so nested scopes accumulate keys with inner values winning.
/// Every exit path — normal return, panic, future drop — pops exactly the
/// frame it pushed.
///
/// # Examples
///
/// ```
/// use beacon::context::{ScopeBackend, ScopeStore};
/// use beacon::envelope::Ctx;
///
/// let store = ScopeStore::new(ScopeBackend::ThreadStack);
/// store.scope_sync(Ctx::new().with("request_id", "r1"), || {
///     assert_eq!(
///         store.current().get("request_id"),
///         Some(&serde_json::json!("r1"))
///     );
/// });
/// assert!(store.current().is_empty());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ScopeStore {
    backend: ScopeBackend,
}

impl ScopeStore {
    /// Creates a store over the given backend.
    pub fn new(backend: ScopeBackend) -> Self {
        Self { backend }
    }

    /// Returns the selected backend.
    pub fn backend(&self) -> ScopeBackend {
        self.backend
    }

    /// Returns the effective scope context at the call site, or an empty
    /// context when no scope is active.
    pub fn current(&self) -> Ctx {
        match self.backend {
            ScopeBackend::TaskLocal => TASK_SCOPE.try_with(Ctx::clone).unwrap_or_default(),
            ScopeBackend::ThreadStack => STACK_SCOPE.with(|stack| {
                stack
                    .borrow()
                    .last()
                    .map(|frame| frame.ctx.clone())
                    .unwrap_or_default()
            }),
        }
    }

    /// Runs `fut` with `ctx` merged onto the current effective scope.
    ///
    /// On the task-local backend the merged frame follows the future across
    /// suspension points. On the thread-stack backend the frame is pushed
    /// when the future starts and popped when it completes or is dropped;
    /// see the module docs for the fallback's limitations.
    ///
    /// Takes `self` by value (the store is `Copy`) so the returned future
    /// is `'static` and can be spawned directly.
    pub async fn scope<F: Future>(self, ctx: Ctx, fut: F) -> F::Output {
        let merged = self.current().merged(&ctx);
        match self.backend {
            ScopeBackend::TaskLocal => TASK_SCOPE.scope(merged, fut).await,
            ScopeBackend::ThreadStack => {
                let _guard = StackGuard::push(merged);
                fut.await
            }
        }
    }

    /// Runs `f` with `ctx` merged onto the current effective scope.
    ///
    /// The frame is popped on every exit path, including unwinding.
    pub fn scope_sync<R>(&self, ctx: Ctx, f: impl FnOnce() -> R) -> R {
        let merged = self.current().merged(&ctx);
        match self.backend {
            ScopeBackend::TaskLocal => TASK_SCOPE.sync_scope(merged, f),
            ScopeBackend::ThreadStack => {
                let _guard = StackGuard::push(merged);
                f()
            }
        }
    }
}

/// Pops its frame on drop. Frames are removed by id, so an interleaved
/// pop from a concurrent scope on the same thread cannot remove the wrong
/// frame.
struct StackGuard {
    id: u64,
}

impl StackGuard {
    fn push(ctx: Ctx) -> Self {
        let id = NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed);
        STACK_SCOPE.with(|stack| stack.borrow_mut().push(Frame { id, ctx }));
        Self { id }
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        STACK_SCOPE.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|frame| frame.id == self.id) {
                stack.remove(pos);
            }
            // Not found: the future migrated threads after pushing. The
            // frame is stranded on the original thread — accepted fallback
            // behavior.
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(key: &str, value: &str) -> Ctx {
        Ctx::new().with(key, value)
    }

    #[test]
    fn thread_stack_nested_scopes_restore() {
        let store = ScopeStore::new(ScopeBackend::ThreadStack);

        store.scope_sync(ctx("request_id", "r1"), || {
            assert_eq!(store.current().get("request_id"), Some(&json!("r1")));

            store.scope_sync(ctx("request_id", "r2"), || {
                assert_eq!(store.current().get("request_id"), Some(&json!("r2")));
            });

            assert_eq!(store.current().get("request_id"), Some(&json!("r1")));
        });

        assert!(store.current().is_empty());
    }

    #[test]
    fn thread_stack_inner_scope_inherits_outer_keys() {
        let store = ScopeStore::new(ScopeBackend::ThreadStack);

        store.scope_sync(ctx("user", "u1"), || {
            store.scope_sync(ctx("request_id", "r1"), || {
                let current = store.current();
                assert_eq!(current.get("user"), Some(&json!("u1")));
                assert_eq!(current.get("request_id"), Some(&json!("r1")));
            });
        });
    }

    #[test]
    fn thread_stack_pops_on_panic() {
        let store = ScopeStore::new(ScopeBackend::ThreadStack);

        let result = std::panic::catch_unwind(|| {
            store.scope_sync(ctx("k", "v"), || panic!("boom"));
        });
        assert!(result.is_err());
        assert!(store.current().is_empty());
    }

    #[test]
    fn task_local_sync_scope_nests() {
        let store = ScopeStore::new(ScopeBackend::TaskLocal);

        store.scope_sync(ctx("a", "1"), || {
            store.scope_sync(ctx("b", "2"), || {
                let current = store.current();
                assert_eq!(current.get("a"), Some(&json!("1")));
                assert_eq!(current.get("b"), Some(&json!("2")));
            });
            assert!(store.current().get("b").is_none());
        });

        assert!(store.current().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn task_local_scope_survives_await() {
        let store = ScopeStore::new(ScopeBackend::TaskLocal);

        store
            .scope(ctx("request_id", "r1"), async {
                assert_eq!(store.current().get("request_id"), Some(&json!("r1")));
                tokio::task::yield_now().await;
                // After potential thread migration:
                assert_eq!(store.current().get("request_id"), Some(&json!("r1")));
            })
            .await;

        assert!(store.current().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn task_local_concurrent_scopes_isolated() {
        let store = ScopeStore::new(ScopeBackend::TaskLocal);
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);

        for i in 0..5 {
            let tx = tx.clone();
            let scoped = store.scope(ctx("task", &format!("t{i}")), async move {
                tokio::task::yield_now().await;
                let store = ScopeStore::new(ScopeBackend::TaskLocal);
                let seen = store.current().get("task").cloned();
                tx.send(seen).await.unwrap();
            });
            tokio::spawn(scoped);
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(value) = rx.recv().await {
            seen.push(value.unwrap());
        }
        seen.sort_by_key(|v| v.as_str().unwrap().to_owned());
        assert_eq!(
            seen,
            vec![json!("t0"), json!("t1"), json!("t2"), json!("t3"), json!("t4")]
        );
    }

    #[tokio::test]
    async fn task_local_nested_async_scopes_merge() {
        let store = ScopeStore::new(ScopeBackend::TaskLocal);

        store
            .scope(ctx("outer", "o"), async {
                store
                    .scope(ctx("inner", "i"), async {
                        let current = store.current();
                        assert_eq!(current.get("outer"), Some(&json!("o")));
                        assert_eq!(current.get("inner"), Some(&json!("i")));
                    })
                    .await;
                assert!(store.current().get("inner").is_none());
            })
            .await;
    }
}
