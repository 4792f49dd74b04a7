use crate::prelude::*;

use async_trait::async_trait;
use std::sync::{Arc, RwLock};

/// Something that wants to hear about every complete snapshot a device
/// produces. Implementations must not hold up the caller; anything slow
/// belongs on a queue drained by a task of its own.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn update(&self, device: &DeviceInfo, snapshot: &Snapshot);
}

pub type ObserverRef = Arc<dyn Observer>;

fn same(a: &ObserverRef, b: &ObserverRef) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Ordered observer list owned by one device.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: RwLock<Vec<ObserverRef>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `observer` unless that same instance is already attached.
    pub fn attach(&self, observer: ObserverRef) {
        let Ok(mut observers) = self.observers.write() else {
            error!("observer list poisoned, not attaching");
            return;
        };
        if !observers.iter().any(|o| same(o, &observer)) {
            observers.push(observer);
        }
    }

    pub fn detach(&self, observer: &ObserverRef) {
        if let Ok(mut observers) = self.observers.write() {
            observers.retain(|o| !same(o, observer));
        }
    }

    pub fn len(&self) -> usize {
        self.observers.read().map(|o| o.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hands `snapshot` to every attached observer in attachment order,
    /// skipping `originator` if given.
    pub async fn notify(&self, device: &DeviceInfo, snapshot: &Snapshot, originator: Option<&ObserverRef>) {
        // clone so the lock is not held across awaits
        let observers: Vec<ObserverRef> = match self.observers.read() {
            Ok(observers) => observers.clone(),
            Err(_) => {
                error!("{}: observer list poisoned, dropping update", device.id);
                return;
            }
        };

        for observer in observers {
            if let Some(originator) = originator {
                if same(&observer, originator) {
                    continue;
                }
            }
            observer.update(device, snapshot).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::TIME_UPDATED;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counter {
        seen: Mutex<Vec<f64>>,
    }

    #[async_trait]
    impl Observer for Counter {
        async fn update(&self, _device: &DeviceInfo, snapshot: &Snapshot) {
            self.seen.lock().unwrap().push(snapshot.time_updated());
        }
    }

    fn snapshot(t: f64) -> Snapshot {
        Snapshot::new(vec![Field::float(TIME_UPDATED)].into(), vec![Value::Float(t)]).unwrap()
    }

    fn info() -> DeviceInfo {
        DeviceInfo {
            id: "battery".to_string(),
            device_type: DeviceType::Battery,
        }
    }

    #[tokio::test]
    async fn attaching_twice_notifies_once() {
        let registry = ObserverRegistry::new();
        let counter = Arc::new(Counter::default());
        let observer: ObserverRef = counter.clone();

        registry.attach(observer.clone());
        registry.attach(observer.clone());
        assert_eq!(registry.len(), 1);

        registry.notify(&info(), &snapshot(1.0), None).await;
        assert_eq!(*counter.seen.lock().unwrap(), vec![1.0]);
    }

    #[tokio::test]
    async fn originator_is_skipped() {
        let registry = ObserverRegistry::new();
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        let a_ref: ObserverRef = a.clone();
        let b_ref: ObserverRef = b.clone();
        registry.attach(a_ref.clone());
        registry.attach(b_ref);

        registry.notify(&info(), &snapshot(2.0), Some(&a_ref)).await;

        assert!(a.seen.lock().unwrap().is_empty());
        assert_eq!(*b.seen.lock().unwrap(), vec![2.0]);
    }

    #[tokio::test]
    async fn detach_absent_is_noop() {
        let registry = ObserverRegistry::new();
        let a: ObserverRef = Arc::new(Counter::default());
        let b: ObserverRef = Arc::new(Counter::default());
        registry.attach(a.clone());

        registry.detach(&b);
        assert_eq!(registry.len(), 1);

        registry.detach(&a);
        assert!(registry.is_empty());
    }
}
