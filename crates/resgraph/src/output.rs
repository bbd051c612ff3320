//! Deferred values produced by resources
//!
//! An [`Output`] is a single-assignment cell: the producing resource settles
//! it exactly once, with a value or with an [`UpstreamFailure`]. Readers either
//! block in [`Output::get`] or register a callback with [`Output::on_settle`],
//! which is how [`Output::all`] and [`Output::map`] compose outputs without
//! parking threads.

use crate::error::{Error, Result, UpstreamFailure};
use crate::spec::{AttrRef, Attributes};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

type Settled<T> = std::result::Result<T, UpstreamFailure>;
type Callback<T> = Box<dyn FnOnce(&Settled<T>) + Send>;

struct Slot<T> {
    value: Option<Settled<T>>,
    callbacks: Vec<Callback<T>>,
}

struct Cell<T> {
    slot: Mutex<Slot<T>>,
    settled: Condvar,
}

/// A value that becomes known once its producer completes
pub struct Output<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for Output<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> std::fmt::Debug for Output<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.lock().value {
            None => "pending",
            Some(Ok(_)) => "resolved",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("Output").field("state", &state).finish()
    }
}

impl<T: Clone + Send + 'static> Default for Output<T> {
    fn default() -> Self {
        Self::pending()
    }
}

impl<T> Output<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.cell.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Send + 'static> Output<T> {
    /// A new, unresolved output
    pub fn pending() -> Self {
        Self {
            cell: Arc::new(Cell {
                slot: Mutex::new(Slot {
                    value: None,
                    callbacks: Vec::new(),
                }),
                settled: Condvar::new(),
            }),
        }
    }

    /// An output that is already resolved
    pub fn resolved(value: T) -> Self {
        let output = Self::pending();
        output.lock().value = Some(Ok(value));
        output
    }

    /// An output that has already failed
    pub fn failed(failure: UpstreamFailure) -> Self {
        let output = Self::pending();
        output.lock().value = Some(Err(failure));
        output
    }

    /// Resolve with a value. Fails if the output was already settled.
    pub fn resolve(&self, value: T) -> Result<()> {
        self.settle(Ok(value))
    }

    /// Settle as failed. Fails if the output was already settled.
    pub fn fail(&self, failure: UpstreamFailure) -> Result<()> {
        self.settle(Err(failure))
    }

    fn settle(&self, result: Settled<T>) -> Result<()> {
        let callbacks = {
            let mut slot = self.lock();
            if slot.value.is_some() {
                return Err(Error::AlreadyResolved);
            }
            slot.value = Some(result.clone());
            std::mem::take(&mut slot.callbacks)
        };
        self.cell.settled.notify_all();

        // Callbacks run outside the lock so they may touch other outputs.
        for callback in callbacks {
            callback(&result);
        }
        Ok(())
    }

    /// Block until settled, then return the value or the upstream failure
    pub fn get(&self) -> Result<T> {
        let slot = self.lock();
        let slot = self
            .cell
            .settled
            .wait_while(slot, |slot| slot.value.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        match &slot.value {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(failure)) => Err(Error::UpstreamFailure(failure.clone())),
            None => Err(Error::Other("output woke without a value".to_string())),
        }
    }

    /// Non-blocking peek: `None` while pending
    pub fn try_get(&self) -> Option<Result<T>> {
        match &self.lock().value {
            None => None,
            Some(Ok(value)) => Some(Ok(value.clone())),
            Some(Err(failure)) => Some(Err(Error::UpstreamFailure(failure.clone()))),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.lock().value.is_some()
    }

    /// Run `callback` once this output settles (immediately if it already has)
    pub fn on_settle<F>(&self, callback: F)
    where
        F: FnOnce(&Settled<T>) + Send + 'static,
    {
        let settled = {
            let mut slot = self.lock();
            match &slot.value {
                Some(value) => value.clone(),
                None => {
                    slot.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&settled);
    }

    /// Derive a new output by transforming this one's value
    pub fn map<U, F>(&self, f: F) -> Output<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let derived = Output::pending();
        let target = derived.clone();
        self.on_settle(move |settled| {
            // `target` is private to this closure, so it cannot already be settled.
            let _ = match settled {
                Ok(value) => target.resolve(f(value.clone())),
                Err(failure) => target.fail(failure.clone()),
            };
        });
        derived
    }

    /// Combine outputs into one resolved when every input resolves
    ///
    /// Values keep the order of `outputs`. The first failure to arrive settles
    /// the combined output; later failures are dropped.
    pub fn all(outputs: Vec<Output<T>>) -> Output<Vec<T>> {
        let combined = Output::pending();
        if outputs.is_empty() {
            let _ = combined.resolve(Vec::new());
            return combined;
        }

        let values: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(vec![None; outputs.len()]));
        let remaining = Arc::new(AtomicUsize::new(outputs.len()));

        for (index, output) in outputs.iter().enumerate() {
            let combined = combined.clone();
            let values = Arc::clone(&values);
            let remaining = Arc::clone(&remaining);
            output.on_settle(move |settled| match settled {
                Ok(value) => {
                    let complete = {
                        let mut values = values.lock().unwrap_or_else(PoisonError::into_inner);
                        values[index] = Some(value.clone());
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            values.iter_mut().map(Option::take).collect::<Option<Vec<T>>>()
                        } else {
                            None
                        }
                    };
                    if let Some(all) = complete {
                        let _ = combined.resolve(all);
                    }
                }
                Err(failure) => {
                    let _ = combined.fail(failure.clone());
                }
            });
        }
        combined
    }
}

/// Typed handle on one attribute of a resource's output
///
/// Converts into an [`Input`](crate::Input) reference, which is how a
/// dependency edge gets declared.
pub struct Ref<T> {
    attr: AttrRef,
    output: Output<Attributes>,
    _type: PhantomData<fn() -> T>,
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self {
            attr: self.attr.clone(),
            output: self.output.clone(),
            _type: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ref({})", self.attr)
    }
}

impl<T> Ref<T> {
    pub(crate) fn new(attr: AttrRef, output: Output<Attributes>) -> Self {
        Self {
            attr,
            output,
            _type: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Ref<T> {
    /// Block until the producing resource settles, then read the attribute
    pub fn get(&self) -> Result<T> {
        let attributes = self.output.get()?;
        let value = self
            .attr
            .lookup(&attributes)
            .cloned()
            .ok_or_else(|| Error::MissingAttribute {
                id: self.attr.source.clone(),
                attribute: self.attr.attribute.clone(),
            })?;
        serde_json::from_value(value).map_err(|source| Error::Deserialize {
            id: self.attr.source.clone(),
            attribute: self.attr.attribute.clone(),
            source,
        })
    }
}

impl<T> From<Ref<T>> for crate::spec::Input {
    fn from(value: Ref<T>) -> Self {
        crate::spec::Input::Ref(value.attr)
    }
}

impl<T> From<&Ref<T>> for crate::spec::Input {
    fn from(value: &Ref<T>) -> Self {
        crate::spec::Input::Ref(value.attr.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ResourceId;
    use serde_json::json;
    use std::thread;
    use std::time::Duration;

    fn failure(name: &str) -> UpstreamFailure {
        UpstreamFailure::new(ResourceId::new("test", name), "boom")
    }

    #[test]
    fn test_resolve_once() {
        let output = Output::pending();
        output.resolve(1).unwrap();
        assert!(matches!(output.resolve(2), Err(Error::AlreadyResolved)));
        assert!(matches!(output.fail(failure("x")), Err(Error::AlreadyResolved)));
        assert_eq!(output.get().unwrap(), 1);
    }

    #[test]
    fn test_get_blocks_until_resolved() {
        let output: Output<String> = Output::pending();
        let producer = output.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.resolve("mlflow".to_string()).unwrap();
        });

        assert_eq!(output.get().unwrap(), "mlflow");
        handle.join().unwrap();
    }

    #[test]
    fn test_get_propagates_failure() {
        let output: Output<u32> = Output::pending();
        output.fail(failure("db")).unwrap();
        match output.get() {
            Err(Error::UpstreamFailure(f)) => assert_eq!(f.resource.name, "db"),
            other => panic!("expected upstream failure, got {other:?}"),
        }
    }

    #[test]
    fn test_try_get() {
        let output = Output::pending();
        assert!(output.try_get().is_none());
        output.resolve(3).unwrap();
        assert_eq!(output.try_get().unwrap().unwrap(), 3);
    }

    #[test]
    fn test_all_keeps_argument_order() {
        let a = Output::pending();
        let b = Output::pending();
        let c = Output::pending();
        let combined = Output::all(vec![a.clone(), b.clone(), c.clone()]);

        c.resolve("c").unwrap();
        a.resolve("a").unwrap();
        assert!(!combined.is_settled());
        b.resolve("b").unwrap();

        assert_eq!(combined.get().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_all_fails_with_first_failure() {
        let a = Output::<u8>::pending();
        let b = Output::pending();
        let combined = Output::all(vec![a.clone(), b.clone()]);

        b.fail(failure("second")).unwrap();
        a.fail(failure("first")).unwrap();

        match combined.get() {
            Err(Error::UpstreamFailure(f)) => assert_eq!(f.resource.name, "second"),
            other => panic!("expected upstream failure, got {other:?}"),
        }
    }

    #[test]
    fn test_all_empty_resolves_immediately() {
        let combined = Output::<u8>::all(Vec::new());
        assert_eq!(combined.get().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_map() {
        let bucket = Output::pending();
        let url = bucket.map(|name: String| format!("s3://{name}"));
        bucket.resolve("mlflow-bucket-1a2b".to_string()).unwrap();
        assert_eq!(url.get().unwrap(), "s3://mlflow-bucket-1a2b");

        let failed: Output<String> = Output::failed(failure("bucket"));
        assert!(failed.map(|s| s.len()).get().is_err());
    }

    #[test]
    fn test_ref_reads_typed_attribute() {
        let output = Output::pending();
        let id = ResourceId::new("aws:rds/instance:Instance", "mlflow-db");
        let port: Ref<u16> = Ref::new(AttrRef::new(id.clone(), "port"), output.clone());
        let missing: Ref<String> = Ref::new(AttrRef::new(id, "address"), output.clone());

        let mut attrs = Attributes::new();
        attrs.insert("port".into(), json!(5432));
        output.resolve(attrs).unwrap();

        assert_eq!(port.get().unwrap(), 5432);
        assert!(matches!(missing.get(), Err(Error::MissingAttribute { .. })));
    }
}
