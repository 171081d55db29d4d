/*!
 * Attribute store.
 *
 * A device keeps its protocol visible state in a tree of [`Value`]s addressed
 * by [`Path`]s. The store has no setter: state moves only by building a
 * [`Change`] and handing it to `Device::apply`, which records what happened on
 * the change and announces the batch as one ATTRIBUTE_CHANGE event.
 *
 * New keys may be created at the root. Anywhere deeper, the parent must
 * already have the key, or be a record whose hook allows new keys.
 */
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use lightsim_core::types::Value;

/// One step of a path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathKey {
    /// Named field
    Key(String),
    /// Position in an array
    Index(usize),
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKey::Key(k) => write!(f, "{}", k),
            PathKey::Index(i) => write!(f, "[{}]", i),
        }
    }
}

/// Location of an attribute
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Path(Vec<PathKey>);

impl Path {
    /// Path to a root attribute
    pub fn root<S: Into<String>>(name: S) -> Self {
        Self(vec![PathKey::Key(name.into())])
    }

    /// Extend with a named field
    pub fn key<S: Into<String>>(mut self, name: S) -> Self {
        self.0.push(PathKey::Key(name.into()));
        self
    }

    /// Extend with an array position
    pub fn index(mut self, i: usize) -> Self {
        self.0.push(PathKey::Index(i));
        self
    }

    /// The steps of this path
    pub fn keys(&self) -> &[PathKey] {
        &self.0
    }

    /// Replace the value at this path
    pub fn change_to<V: Into<Value>>(self, value: V) -> Change {
        Change::new(self, ChangeKind::Replace(value.into()))
    }

    /// Truncate the array at this path to `len` items
    pub fn reduce_length_to(self, len: usize) -> Change {
        Change::new(self, ChangeKind::ReduceLength(len))
    }
}

impl From<&str> for Path {
    fn from(name: &str) -> Self {
        Path::root(name)
    }
}

impl From<String> for Path {
    fn from(name: String) -> Self {
        Path::root(name)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, key) in self.0.iter().enumerate() {
            if i > 0 && matches!(key, PathKey::Key(_)) {
                write!(f, ".")?;
            }
            write!(f, "{}", key)?;
        }
        Ok(())
    }
}

/// What a change does
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    /// Replace the value
    Replace(Value),
    /// Truncate an array
    ReduceLength(usize),
}

#[derive(Debug, Clone, PartialEq)]
struct Outcome {
    before: Option<Value>,
    after: Option<Value>,
    error: Option<String>,
}

/// One attribute mutation and, once applied, what it did
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    path: Path,
    kind: ChangeKind,
    outcome: Option<Outcome>,
}

impl Change {
    /// A change that has not been applied yet
    pub fn new(path: Path, kind: ChangeKind) -> Self {
        Self {
            path,
            kind,
            outcome: None,
        }
    }

    /// Where the change goes
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// What the change does
    pub fn kind(&self) -> &ChangeKind {
        &self.kind
    }

    /// Whether the change has been applied
    pub fn applied(&self) -> bool {
        self.outcome.is_some()
    }

    /// Whether the change was applied and took effect
    pub fn success(&self) -> bool {
        self.outcome
            .as_ref()
            .map(|o| o.error.is_none())
            .unwrap_or(false)
    }

    /// Value before the change, `None` when the path did not exist
    pub fn before(&self) -> Option<&Value> {
        self.outcome.as_ref().and_then(|o| o.before.as_ref())
    }

    /// Value after the change, `None` when the path does not exist
    pub fn after(&self) -> Option<&Value> {
        self.outcome.as_ref().and_then(|o| o.after.as_ref())
    }

    /// Why the change failed
    pub fn error(&self) -> Option<&str> {
        self.outcome.as_ref().and_then(|o| o.error.as_deref())
    }

    /// Apply to `root`. Only the first call mutates.
    pub(crate) fn apply_to(&mut self, root: &mut BTreeMap<String, Value>) {
        if self.outcome.is_some() {
            return;
        }
        let before = lookup(root, self.path.keys()).cloned();
        let error = mutate(root, self.path.keys(), &self.kind).err();
        let after = lookup(root, self.path.keys()).cloned();
        self.outcome = Some(Outcome {
            before,
            after,
            error,
        });
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: Option<&Value>| v.map(|v| v.to_string()).unwrap_or_else(|| "<missing>".into());
        match (&self.outcome, &self.kind) {
            (None, ChangeKind::Replace(v)) => write!(f, "<Change {} -> {} (pending)>", self.path, v),
            (None, ChangeKind::ReduceLength(n)) => {
                write!(f, "<Change {} length -> {} (pending)>", self.path, n)
            }
            (Some(o), _) => match &o.error {
                None => write!(
                    f,
                    "<Change {}: {} -> {}>",
                    self.path,
                    show(o.before.as_ref()),
                    show(o.after.as_ref())
                ),
                Some(err) => write!(f, "<Change {} failed: {}>", self.path, err),
            },
        }
    }
}

fn lookup<'a>(root: &'a BTreeMap<String, Value>, keys: &[PathKey]) -> Option<&'a Value> {
    let (first, rest) = keys.split_first()?;
    let PathKey::Key(name) = first else {
        return None;
    };
    let mut current = root.get(name)?;
    for key in rest {
        current = match (key, current) {
            (PathKey::Key(k), Value::Record(r)) => r.get(k)?,
            (PathKey::Index(i), Value::Array(items)) => items.get(*i)?,
            _ => return None,
        };
    }
    Some(current)
}

fn lookup_mut<'a>(root: &'a mut BTreeMap<String, Value>, keys: &[PathKey]) -> Option<&'a mut Value> {
    let (first, rest) = keys.split_first()?;
    let PathKey::Key(name) = first else {
        return None;
    };
    let mut current = root.get_mut(name)?;
    for key in rest {
        current = match current {
            Value::Record(r) => match key {
                PathKey::Key(k) => r.get_mut(k)?,
                PathKey::Index(_) => return None,
            },
            Value::Array(items) => match key {
                PathKey::Index(i) => items.get_mut(*i)?,
                PathKey::Key(_) => return None,
            },
            _ => return None,
        };
    }
    Some(current)
}

fn mutate(root: &mut BTreeMap<String, Value>, keys: &[PathKey], kind: &ChangeKind) -> Result<(), String> {
    let path = Path(keys.to_vec());
    match kind {
        ChangeKind::ReduceLength(len) => match lookup_mut(root, keys) {
            Some(Value::Array(items)) => {
                items.truncate(*len);
                Ok(())
            }
            Some(other) => Err(format!("{} is {}, not an array", path, other.type_name())),
            None => Err(format!("{} not found", path)),
        },
        ChangeKind::Replace(value) => {
            let Some((last, parent)) = keys.split_last() else {
                return Err("empty path".to_string());
            };
            if parent.is_empty() {
                return match last {
                    PathKey::Key(name) => {
                        root.insert(name.clone(), value.clone());
                        Ok(())
                    }
                    PathKey::Index(_) => Err(format!("{} must start with a name", path)),
                };
            }
            let parent_path = Path(parent.to_vec());
            match (lookup_mut(root, parent), last) {
                (Some(Value::Record(record)), PathKey::Key(k)) => {
                    record.assign(k, value.clone()).map_err(|e| e.to_string())
                }
                (Some(Value::Array(items)), PathKey::Index(i)) => match items.get_mut(*i) {
                    Some(slot) => {
                        *slot = value.clone();
                        Ok(())
                    }
                    None => Err(format!("{} out of range for {} items", path, items.len())),
                },
                (Some(other), _) => Err(format!(
                    "cannot address {} inside {}",
                    last,
                    other.type_name()
                )),
                (None, _) => Err(format!("{} not found", parent_path)),
            }
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    root: BTreeMap<String, Value>,
    started: bool,
}

/// Attribute tree of one device
#[derive(Debug, Default)]
pub struct Attrs {
    inner: Mutex<Inner>,
}

impl Attrs {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read the value at `path`
    pub fn get<P: Into<Path>>(&self, path: P) -> Option<Value> {
        lookup(&self.lock().root, path.into().keys()).cloned()
    }

    /// Whether `path` resolves
    pub fn contains<P: Into<Path>>(&self, path: P) -> bool {
        lookup(&self.lock().root, path.into().keys()).is_some()
    }

    /// Read an integer
    pub fn int<P: Into<Path>>(&self, path: P) -> Option<i64> {
        self.get(path).and_then(|v| v.as_integer())
    }

    /// Read a boolean
    pub fn bool<P: Into<Path>>(&self, path: P) -> Option<bool> {
        self.get(path).and_then(|v| v.as_bool())
    }

    /// Read a string
    pub fn string<P: Into<Path>>(&self, path: P) -> Option<String> {
        self.get(path).and_then(|v| v.as_str().map(str::to_string))
    }

    /// Copy of the whole tree
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.lock().root.clone()
    }

    /// Names of the root attributes
    pub fn names(&self) -> Vec<String> {
        self.lock().root.keys().cloned().collect()
    }

    /// Whether the store has finished initialising
    pub fn started(&self) -> bool {
        self.lock().started
    }

    pub(crate) fn set_started(&self, started: bool) {
        self.lock().started = started;
    }

    pub(crate) fn clear(&self) {
        let mut inner = self.lock();
        inner.root.clear();
        inner.started = false;
    }

    /// Apply `changes` in order and report whether the store had started
    pub(crate) fn apply(&self, changes: &mut [Change]) -> bool {
        let mut inner = self.lock();
        for change in changes.iter_mut() {
            change.apply_to(&mut inner.root);
        }
        inner.started
    }
}
