//! Service registry.
//!
//! The registry stores *descriptors*, not instances. Nothing is constructed at
//! registration time; each factory runs lazily on first resolution and, for
//! singletons, its result is cached for the lifetime of the registry.
//!
//! Factories declare their dependencies explicitly by resolving other keys
//! through the [`Resolver`] they are handed. The registry tracks which keys
//! each thread is constructing, so a factory which (directly, transitively, or
//! through a [`RegistryHandle`]) re-enters a key still under construction
//! fails with [`KeelError::CircularDependency`] instead of recursing forever.
//!
//! # Example
//!
//! ```rust
//! use keel_core::registry::{Registry, ServiceKey};
//! use keel_core::ExecutionContext;
//! use std::sync::Arc;
//!
//! struct Database {
//!     url: String,
//! }
//!
//! struct UserRepository {
//!     db: Arc<Database>,
//! }
//!
//! let registry = Registry::new(ExecutionContext::WebWorker);
//! registry.singleton("db", |_| {
//!     Ok(Database {
//!         url: "postgres://localhost/app".to_string(),
//!     })
//! });
//! registry.singleton("users", |r| {
//!     Ok(UserRepository {
//!         db: r.resolve::<Database>("db")?,
//!     })
//! });
//!
//! let users: Arc<UserRepository> = registry.resolve("users").unwrap();
//! assert_eq!(users.db.url, "postgres://localhost/app");
//! ```
//!
//! # Concurrency
//!
//! The first thread to resolve an unbuilt singleton becomes its builder and
//! runs the factory without holding any registry lock. Other threads asking
//! for the same key wait until the builder finishes and then share its
//! instance, so exactly one instance is ever handed out.
//!
//! A wait that could never end is reported as
//! [`KeelError::CircularDependency`] instead:
//!
//! - the builder itself asks for the key again, for example through a
//!   [`RegistryHandle`] captured by its factory
//! - two threads each build one half of a dependency cycle and wait on the
//!   other half

use std::any::{type_name, Any};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use crate::context::ExecutionContext;
use crate::error::{KeelError, KeelResult};

/// A type-erased service instance.
pub type Instance = Arc<dyn Any + Send + Sync>;

type Factory = Arc<dyn Fn(&Resolver<'_>) -> KeelResult<Instance> + Send + Sync>;

/// Identity of a registered service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey(Cow<'static, str>);

impl ServiceKey {
    /// Creates a key from a static name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Creates a key named after a Rust type.
    #[must_use]
    pub fn of<T: ?Sized>() -> Self {
        Self(Cow::Borrowed(type_name::<T>()))
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for ServiceKey {
    fn from(name: &'static str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ServiceKey {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

impl From<&ServiceKey> for ServiceKey {
    fn from(key: &ServiceKey) -> Self {
        key.clone()
    }
}

/// How often a descriptor's factory runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// At most once per registry; the instance is cached.
    Singleton,
    /// On every resolution.
    Transient,
}

#[derive(Clone)]
enum Descriptor {
    Factory { factory: Factory, lifetime: Lifetime },
    Alias { target: ServiceKey },
}

/// Keys under construction, and who is waiting for them.
#[derive(Default)]
struct Construction {
    /// Keys each thread is constructing, outermost first.
    stacks: HashMap<ThreadId, Vec<ServiceKey>>,
    /// The thread building each unbuilt singleton.
    builders: HashMap<ServiceKey, ThreadId>,
    /// The singleton each blocked thread is waiting for.
    waiting: HashMap<ThreadId, ServiceKey>,
}

impl Construction {
    /// Follows builder -> awaited key edges from `key`. Returns the keys
    /// walked if the walk comes back to `me`.
    fn wait_cycle(&self, me: ThreadId, key: &ServiceKey) -> Option<Vec<String>> {
        let mut chain = vec![key.to_string()];
        let mut current = key;
        for _ in 0..=self.waiting.len() {
            let builder = self.builders.get(current)?;
            if *builder == me {
                chain.push(key.to_string());
                return Some(chain);
            }
            current = self.waiting.get(builder)?;
            chain.push(current.to_string());
        }
        None
    }
}

struct Inner {
    context: ExecutionContext,
    descriptors: RwLock<HashMap<ServiceKey, Descriptor>>,
    singletons: Mutex<HashMap<ServiceKey, Instance>>,
    construction: Mutex<Construction>,
    built: Condvar,
}

/// Releases a builder claim when construction ends, including by panic.
struct BuildClaim<'a> {
    inner: &'a Inner,
    key: ServiceKey,
}

impl Drop for BuildClaim<'_> {
    fn drop(&mut self) {
        self.inner.construction.lock().builders.remove(&self.key);
        self.inner.built.notify_all();
    }
}

/// One entry on the current thread's construction stack.
struct StackFrame<'a> {
    inner: &'a Inner,
    thread: ThreadId,
}

impl<'a> StackFrame<'a> {
    /// Pushes `key`, or reports the cycle if this thread is already
    /// constructing it.
    fn enter(inner: &'a Inner, key: &ServiceKey) -> KeelResult<Self> {
        let thread = thread::current().id();
        let mut construction = inner.construction.lock();
        let stack = construction.stacks.entry(thread).or_default();
        if stack.contains(key) {
            let mut chain: Vec<String> = stack.iter().map(ToString::to_string).collect();
            chain.push(key.to_string());
            return Err(KeelError::circular(chain));
        }
        stack.push(key.clone());
        Ok(Self { inner, thread })
    }
}

impl Drop for StackFrame<'_> {
    fn drop(&mut self) {
        let mut construction = self.inner.construction.lock();
        if let Some(stack) = construction.stacks.get_mut(&self.thread) {
            stack.pop();
            if stack.is_empty() {
                construction.stacks.remove(&self.thread);
            }
        }
    }
}

/// A lazily-resolving service registry.
///
/// `Registry` is a cheap, cloneable handle; all clones share the same
/// descriptors and singleton cache.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    /// Creates an empty registry for the given execution context.
    #[must_use]
    pub fn new(context: ExecutionContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                context,
                descriptors: RwLock::new(HashMap::new()),
                singletons: Mutex::new(HashMap::new()),
                construction: Mutex::new(Construction::default()),
                built: Condvar::new(),
            }),
        }
    }

    /// The execution context factories should branch on.
    #[must_use]
    pub fn context(&self) -> ExecutionContext {
        self.inner.context
    }

    /// Registers a factory under `key`.
    ///
    /// Re-registering an existing key replaces the descriptor (last
    /// registration wins) and discards any cached singleton for it.
    pub fn register<T, F>(&self, key: impl Into<ServiceKey>, lifetime: Lifetime, factory: F)
    where
        T: Any + Send + Sync,
        F: Fn(&Resolver<'_>) -> KeelResult<T> + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |resolver| {
            factory(resolver).map(|value| Arc::new(value) as Instance)
        });
        self.insert(key.into(), Descriptor::Factory { factory, lifetime });
    }

    /// Registers a singleton factory.
    pub fn singleton<T, F>(&self, key: impl Into<ServiceKey>, factory: F)
    where
        T: Any + Send + Sync,
        F: Fn(&Resolver<'_>) -> KeelResult<T> + Send + Sync + 'static,
    {
        self.register(key, Lifetime::Singleton, factory);
    }

    /// Registers a transient factory.
    pub fn transient<T, F>(&self, key: impl Into<ServiceKey>, factory: F)
    where
        T: Any + Send + Sync,
        F: Fn(&Resolver<'_>) -> KeelResult<T> + Send + Sync + 'static,
    {
        self.register(key, Lifetime::Transient, factory);
    }

    /// Registers an already-built value as a singleton.
    pub fn instance<T: Any + Send + Sync>(&self, key: impl Into<ServiceKey>, value: T) {
        let value: Instance = Arc::new(value);
        let factory: Factory = Arc::new(move |_| Ok(Arc::clone(&value)));
        self.insert(
            key.into(),
            Descriptor::Factory {
                factory,
                lifetime: Lifetime::Singleton,
            },
        );
    }

    /// Registers `key` as a pass-through to `target`.
    pub fn alias(&self, key: impl Into<ServiceKey>, target: impl Into<ServiceKey>) {
        self.insert(
            key.into(),
            Descriptor::Alias {
                target: target.into(),
            },
        );
    }

    fn insert(&self, key: ServiceKey, descriptor: Descriptor) {
        self.inner.singletons.lock().remove(&key);
        self.inner.descriptors.write().insert(key, descriptor);
    }

    /// Returns `true` if a descriptor exists for `key`.
    #[must_use]
    pub fn contains(&self, key: impl Into<ServiceKey>) -> bool {
        self.inner.descriptors.read().contains_key(&key.into())
    }

    /// Returns the number of registered descriptors (aliases included).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.descriptors.read().len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.descriptors.read().is_empty()
    }

    /// Resolves `key` as a `T`.
    ///
    /// # Errors
    ///
    /// - [`KeelError::UnknownService`] if no descriptor exists
    /// - [`KeelError::CircularDependency`] on an alias or dependency cycle
    /// - [`KeelError::ServiceTypeMismatch`] if the instance is not a `T`
    /// - whatever the factory itself returned
    pub fn resolve<T: Any + Send + Sync>(&self, key: impl Into<ServiceKey>) -> KeelResult<Arc<T>> {
        Resolver::new(self).resolve(key)
    }

    /// Resolves `key` and clones the value out of its `Arc`.
    ///
    /// Useful for services registered as handles such as
    /// `Arc<dyn SomeTrait>`.
    pub fn resolve_cloned<T: Any + Send + Sync + Clone>(
        &self,
        key: impl Into<ServiceKey>,
    ) -> KeelResult<T> {
        Resolver::new(self).resolve_cloned(key)
    }

    /// Returns a weak handle for services that need to look up other
    /// services after construction.
    #[must_use]
    pub fn handle(&self) -> RegistryHandle {
        RegistryHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Returns the cached instance, or claims the key for this thread.
    ///
    /// Blocks while another thread builds `key`.
    fn cached_or_claim(&self, key: &ServiceKey) -> KeelResult<Result<Instance, BuildClaim<'_>>> {
        let me = thread::current().id();
        let mut construction = self.inner.construction.lock();
        loop {
            if let Some(instance) = self.inner.singletons.lock().get(key) {
                return Ok(Ok(Arc::clone(instance)));
            }
            match construction.builders.get(key).copied() {
                None => {
                    construction.builders.insert(key.clone(), me);
                    return Ok(Err(BuildClaim {
                        inner: &self.inner,
                        key: key.clone(),
                    }));
                }
                Some(builder) if builder == me => {
                    let mut chain: Vec<String> = construction
                        .stacks
                        .get(&me)
                        .map(|stack| stack.iter().map(ToString::to_string).collect())
                        .unwrap_or_default();
                    chain.push(key.to_string());
                    return Err(KeelError::circular(chain));
                }
                Some(_) => {
                    if let Some(chain) = construction.wait_cycle(me, key) {
                        return Err(KeelError::circular(chain));
                    }
                    construction.waiting.insert(me, key.clone());
                    self.inner.built.wait(&mut construction);
                    construction.waiting.remove(&me);
                }
            }
        }
    }

    /// Follows aliases from `key` to a factory descriptor.
    fn canonical(&self, key: &ServiceKey) -> KeelResult<(ServiceKey, Factory, Lifetime)> {
        let descriptors = self.inner.descriptors.read();
        let mut current = key.clone();
        let mut seen: HashSet<ServiceKey> = HashSet::new();
        let mut path = vec![current.to_string()];

        loop {
            match descriptors.get(&current) {
                None => return Err(KeelError::unknown_service(current.as_str())),
                Some(Descriptor::Factory { factory, lifetime }) => {
                    return Ok((current, Arc::clone(factory), *lifetime));
                }
                Some(Descriptor::Alias { target }) => {
                    seen.insert(current.clone());
                    path.push(target.to_string());
                    if seen.contains(target) {
                        return Err(KeelError::circular(path));
                    }
                    current = target.clone();
                }
            }
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("context", &self.inner.context)
            .field("descriptor_count", &self.len())
            .field("singleton_count", &self.inner.singletons.lock().len())
            .finish()
    }
}

/// Resolution scope handed to factories.
pub struct Resolver<'a> {
    registry: &'a Registry,
}

impl<'a> Resolver<'a> {
    fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    /// The execution context of the owning registry.
    #[must_use]
    pub fn context(&self) -> ExecutionContext {
        self.registry.context()
    }

    /// A weak handle to the owning registry.
    #[must_use]
    pub fn handle(&self) -> RegistryHandle {
        self.registry.handle()
    }

    /// Resolves a dependency as a `T`.
    pub fn resolve<T: Any + Send + Sync>(&self, key: impl Into<ServiceKey>) -> KeelResult<Arc<T>> {
        let key = key.into();
        self.resolve_erased(&key)?
            .downcast::<T>()
            .map_err(|_| KeelError::ServiceTypeMismatch {
                key: key.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Resolves a dependency and clones the value out of its `Arc`.
    pub fn resolve_cloned<T: Any + Send + Sync + Clone>(
        &self,
        key: impl Into<ServiceKey>,
    ) -> KeelResult<T> {
        self.resolve::<T>(key).map(|value| T::clone(&value))
    }

    fn resolve_erased(&self, key: &ServiceKey) -> KeelResult<Instance> {
        let (canonical, factory, lifetime) = self.registry.canonical(key)?;

        match lifetime {
            Lifetime::Transient => self.construct(&canonical, &factory),
            Lifetime::Singleton => {
                let claim = match self.registry.cached_or_claim(&canonical)? {
                    Ok(instance) => return Ok(instance),
                    Err(claim) => claim,
                };
                let instance = self.construct(&canonical, &factory)?;
                self.registry
                    .inner
                    .singletons
                    .lock()
                    .insert(canonical, Arc::clone(&instance));
                drop(claim);
                Ok(instance)
            }
        }
    }

    fn construct(&self, key: &ServiceKey, factory: &Factory) -> KeelResult<Instance> {
        let frame = StackFrame::enter(&self.registry.inner, key)?;
        debug!(service = %key, context = %self.context(), "constructing service");
        let result = factory(self);
        drop(frame);
        result.map_err(|err| match err {
            KeelError::UnknownService { .. }
            | KeelError::CircularDependency { .. }
            | KeelError::ServiceTypeMismatch { .. }
            | KeelError::ServiceFactory { .. } => err,
            other => KeelError::service_factory(key.as_str(), other),
        })
    }
}

/// A non-owning handle to a [`Registry`].
///
/// Services that keep a reference back to the registry hold this instead of a
/// `Registry` clone so the registry never owns a cycle through itself.
#[derive(Clone)]
pub struct RegistryHandle {
    inner: Weak<Inner>,
}

impl RegistryHandle {
    /// Upgrades to a full registry if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Registry> {
        self.inner.upgrade().map(|inner| Registry { inner })
    }

    /// Resolves `key` through the registry this handle points at.
    pub fn resolve<T: Any + Send + Sync>(&self, key: impl Into<ServiceKey>) -> KeelResult<Arc<T>> {
        self.upgrade()
            .ok_or_else(|| KeelError::internal("service registry has been dropped"))?
            .resolve(key)
    }
}

impl fmt::Debug for RegistryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryHandle")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
