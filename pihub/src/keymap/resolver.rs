use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tracing::{debug, info};

use super::Keymap;
use crate::dispatch::Action;
use crate::timing::{KeyEvent, KeyTiming};

/// One published version of the binding state.
#[derive(Debug, Clone)]
pub struct ActiveKeymap {
    pub version: u64,
    pub activity: Option<String>,
    pub keymap: Arc<Keymap>,
}

impl ActiveKeymap {
    pub fn resolve(&self, event: &KeyEvent) -> Option<Action> {
        let activity = self.activity.as_deref()?;
        self.keymap
            .entries(activity, &event.key)
            .iter()
            .find_map(|entry| entry.action_for(event.kind))
    }

    pub fn timing_for(&self, key: &str, defaults: KeyTiming) -> KeyTiming {
        let Some(activity) = self.activity.as_deref() else {
            return defaults;
        };
        let entries = self.keymap.entries(activity, key);
        KeyTiming {
            long_press: entries
                .iter()
                .find_map(|entry| entry.long_press)
                .unwrap_or(defaults.long_press),
            repeat: entries.iter().any(|entry| entry.repeat),
        }
    }
}

/// Maps key events to at most one action under the current activity.
///
/// Activity and keymap live in a single snapshot that writers replace
/// wholesale, so a resolution never mixes two versions.
pub struct KeymapResolver {
    active: watch::Sender<Arc<ActiveKeymap>>,
    defaults: KeyTiming,
    idle_logged: AtomicBool,
}

impl KeymapResolver {
    pub fn new(keymap: Keymap, defaults: KeyTiming) -> Self {
        let (active, _) = watch::channel(Arc::new(ActiveKeymap {
            version: 0,
            activity: None,
            keymap: Arc::new(keymap),
        }));
        Self {
            active,
            defaults,
            idle_logged: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> Arc<ActiveKeymap> {
        Arc::clone(&*self.active.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ActiveKeymap>> {
        self.active.subscribe()
    }

    pub fn activity(&self) -> Option<String> {
        self.snapshot().activity.clone()
    }

    pub fn set_activity(&self, activity: Option<String>) {
        let activity = activity.filter(|name| !name.is_empty());
        self.active.send_if_modified(|current| {
            if current.activity == activity {
                return false;
            }
            info!(from = ?current.activity, to = ?activity, "activity changed");
            *current = Arc::new(ActiveKeymap {
                version: current.version + 1,
                activity: activity.clone(),
                keymap: Arc::clone(&current.keymap),
            });
            true
        });
        self.idle_logged.store(false, Ordering::Relaxed);
    }

    pub fn swap_keymap(&self, keymap: Keymap) {
        let keymap = Arc::new(keymap);
        self.active.send_modify(|current| {
            *current = Arc::new(ActiveKeymap {
                version: current.version + 1,
                activity: current.activity.clone(),
                keymap,
            });
        });
    }

    pub fn resolve(&self, event: &KeyEvent) -> Option<Action> {
        let snapshot = self.snapshot();
        if snapshot.activity.is_none() {
            if !self.idle_logged.swap(true, Ordering::Relaxed) {
                info!("activity not set yet; ignoring input");
            }
            return None;
        }

        let action = snapshot.resolve(event);
        if action.is_none() {
            debug!(
                key = event.key.as_str(),
                kind = ?event.kind,
                activity = ?snapshot.activity,
                "no binding"
            );
        }
        action
    }

    pub fn timing_for(&self, key: &str) -> KeyTiming {
        self.snapshot().timing_for(key, self.defaults)
    }

    pub fn has_logged_idle(&self) -> bool {
        self.idle_logged.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::Instant;

    use super::*;
    use crate::timing::EventKind;

    fn keymap(text: &str) -> Keymap {
        Keymap::from_json(
            &json!({
                "scancode_map": {},
                "activities": {
                    "watch": {
                        "rem_ok": [{"do": "emit", "text": text, "repeat": true, "long_press_ms": 900}]
                    },
                    "*": {
                        "rem_home": [{"do": "emit", "text": "home"}]
                    }
                }
            })
            .to_string(),
        )
        .expect("valid keymap")
    }

    fn event(key: &str, kind: EventKind) -> KeyEvent {
        KeyEvent {
            key: key.to_string(),
            kind,
            at: Instant::now(),
        }
    }

    fn emitted(action: Option<Action>) -> Option<String> {
        match action? {
            Action::Emit { text, .. } => Some(text),
            _ => None,
        }
    }

    #[test]
    fn no_action_until_activity_is_known() {
        let resolver = KeymapResolver::new(keymap("select"), KeyTiming::default());
        assert_eq!(resolver.resolve(&event("rem_ok", EventKind::Down)), None);
        assert!(resolver.has_logged_idle());
        assert_eq!(resolver.resolve(&event("rem_ok", EventKind::Up)), None);

        resolver.set_activity(Some("watch".to_string()));
        assert!(!resolver.has_logged_idle());
        assert_eq!(
            emitted(resolver.resolve(&event("rem_ok", EventKind::Down))).as_deref(),
            Some("select")
        );

        resolver.set_activity(None);
        assert_eq!(resolver.resolve(&event("rem_ok", EventKind::Down)), None);
        assert!(resolver.has_logged_idle());
    }

    #[test]
    fn resolves_exact_then_wildcard() {
        let resolver = KeymapResolver::new(keymap("select"), KeyTiming::default());
        resolver.set_activity(Some("watch".to_string()));

        assert_eq!(
            emitted(resolver.resolve(&event("rem_ok", EventKind::Repeat))).as_deref(),
            Some("select")
        );
        assert_eq!(
            emitted(resolver.resolve(&event("rem_home", EventKind::Down))).as_deref(),
            Some("home")
        );
        assert_eq!(resolver.resolve(&event("rem_ok", EventKind::Up)), None);
        assert_eq!(resolver.resolve(&event("rem_unbound", EventKind::Down)), None);
    }

    #[test]
    fn timing_reflects_current_bindings() {
        let defaults = KeyTiming::default();
        let resolver = KeymapResolver::new(keymap("select"), defaults);
        assert_eq!(resolver.timing_for("rem_ok"), defaults);

        resolver.set_activity(Some("watch".to_string()));
        let timing = resolver.timing_for("rem_ok");
        assert!(timing.repeat);
        assert_eq!(timing.long_press, Duration::from_millis(900));
        assert_eq!(resolver.timing_for("rem_home").long_press, defaults.long_press);
    }

    #[test]
    fn versions_advance_on_every_publish() {
        let resolver = KeymapResolver::new(keymap("select"), KeyTiming::default());
        let mut updates = resolver.subscribe();

        resolver.set_activity(Some("watch".to_string()));
        resolver.set_activity(Some("watch".to_string()));
        assert_eq!(resolver.snapshot().version, 1);

        resolver.swap_keymap(keymap("enter"));
        assert_eq!(resolver.snapshot().version, 2);
        assert!(updates.has_changed().expect("sender alive"));
        assert_eq!(updates.borrow_and_update().activity.as_deref(), Some("watch"));
    }

    #[test]
    fn swaps_are_atomic_for_readers() {
        let resolver = Arc::new(KeymapResolver::new(keymap("old"), KeyTiming::default()));
        resolver.set_activity(Some("watch".to_string()));

        let writer = {
            let resolver = Arc::clone(&resolver);
            std::thread::spawn(move || {
                for round in 0..500 {
                    let text = if round % 2 == 0 { "new" } else { "old" };
                    resolver.swap_keymap(keymap(text));
                }
            })
        };

        for _ in 0..500 {
            let snapshot = resolver.snapshot();
            let down = emitted(snapshot.resolve(&event("rem_ok", EventKind::Down)));
            let repeat = emitted(snapshot.resolve(&event("rem_ok", EventKind::Repeat)));
            assert!(matches!(down.as_deref(), Some("old" | "new")));
            assert_eq!(down, repeat);
        }

        writer.join().expect("writer thread");
    }
}
