use fxhash::FxBuildHasher;

/// Unordered containers. Whatever clients observe is kept in ordered ones.
pub type Map<K, V> = hashbrown::HashMap<K, V, FxBuildHasher>;
pub type Set<T> = hashbrown::HashSet<T, FxBuildHasher>;
