use crate::iter::{Iter, Keys, Values};
use crate::map::{HashMap, TryInsertError};
use crate::reclaim::{Guard, GuardRef};
use std::borrow::Borrow;
use std::fmt::{self, Debug, Formatter};
use std::hash::{BuildHasher, Hash};

/// A reference to a [`HashMap`] with an attached [`Guard`], so individual
/// calls need no guard argument.
///
/// Constructed with [`HashMap::pin`] or [`HashMap::with_guard`]. Reclamation
/// of anything the map unlinks is held up for as long as this reference
/// lives, so prefer short-lived pins.
pub struct HashMapRef<'map, K, V, S = crate::DefaultHashBuilder> {
    map: &'map HashMap<K, V, S>,
    guard: GuardRef<'map>,
}

impl<K, V, S> HashMap<K, V, S> {
    /// Returns a reference to this map that pins it for the duration.
    pub fn pin(&self) -> HashMapRef<'_, K, V, S> {
        HashMapRef {
            guard: GuardRef::Owned(self.guard()),
            map: self,
        }
    }

    /// Returns a reference to this map bound to an existing guard.
    pub fn with_guard<'g>(&'g self, guard: &'g Guard<'g>) -> HashMapRef<'g, K, V, S> {
        HashMapRef {
            guard: GuardRef::Ref(guard),
            map: self,
        }
    }
}

impl<K, V, S> HashMapRef<'_, K, V, S> {
    /// Returns the number of entries in the map; see [`HashMap::len`].
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// An iterator over the map's entries; see [`HashMap::iter`].
    pub fn iter(&self) -> Iter<'_, K, V> {
        self.map.iter(&self.guard)
    }

    /// An iterator over the map's keys; see [`HashMap::keys`].
    pub fn keys(&self) -> Keys<'_, K, V> {
        self.map.keys(&self.guard)
    }

    /// An iterator over the map's values; see [`HashMap::values`].
    pub fn values(&self) -> Values<'_, K, V> {
        self.map.values(&self.guard)
    }
}

impl<K, V, S> HashMapRef<'_, K, V, S>
where
    K: Hash + Ord,
    S: BuildHasher,
{
    /// Returns `true` if the map contains a value for the key; see
    /// [`HashMap::contains_key`].
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.map.contains_key(key, &self.guard)
    }

    /// Returns the value mapped to `key`; see [`HashMap::get`].
    pub fn get<'g, Q>(&'g self, key: &Q) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.map.get(key, &self.guard)
    }

    /// Returns the key and value for `key`; see [`HashMap::get_key_value`].
    pub fn get_key_value<'g, Q>(&'g self, key: &Q) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.map.get_key_value(key, &self.guard)
    }
}

impl<K, V, S> HashMapRef<'_, K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Ord,
    V: 'static + Sync + Send,
    S: BuildHasher,
{
    /// Maps `key` to `value`; see [`HashMap::insert`].
    pub fn insert<'g>(&'g self, key: K, value: V) -> Option<&'g V> {
        self.map.insert(key, value, &self.guard)
    }

    /// Maps `key` to `value` unless the key is present; see
    /// [`HashMap::put_if_absent`].
    pub fn put_if_absent<'g>(&'g self, key: K, value: V) -> Option<&'g V> {
        self.map.put_if_absent(key, value, &self.guard)
    }

    /// Inserts the pair or hands the value back; see
    /// [`HashMap::try_insert`].
    pub fn try_insert<'g>(&'g self, key: K, value: V) -> Result<&'g V, TryInsertError<'g, V>> {
        self.map.try_insert(key, value, &self.guard)
    }

    /// Returns the value for `key`, inserting `init`'s result if absent;
    /// see [`HashMap::compute_if_absent`] for the re-entrancy caveat.
    pub fn compute_if_absent<'g, F>(&'g self, key: K, init: F) -> &'g V
    where
        F: FnOnce(&K) -> V,
    {
        self.map.compute_if_absent(key, init, &self.guard)
    }

    /// Recomputes the value for a present `key`; see
    /// [`HashMap::compute_if_present`].
    pub fn compute_if_present<'g, Q, F>(&'g self, key: &Q, remap: F) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
        F: FnOnce(&K, &V) -> Option<V>,
    {
        self.map.compute_if_present(key, remap, &self.guard)
    }

    /// Computes a mapping for `key` from its current state; see
    /// [`HashMap::compute`].
    pub fn compute<'g, F>(&'g self, key: K, remap: F) -> Option<&'g V>
    where
        F: FnOnce(&K, Option<&V>) -> Option<V>,
    {
        self.map.compute(key, remap, &self.guard)
    }

    /// Inserts or combines `value` with the current one; see
    /// [`HashMap::merge`].
    pub fn merge<'g, F>(&'g self, key: K, value: V, remap: F) -> Option<&'g V>
    where
        F: FnOnce(&V, V) -> Option<V>,
    {
        self.map.merge(key, value, remap, &self.guard)
    }

    /// Removes the entry for `key`; see [`HashMap::remove`].
    pub fn remove<'g, Q>(&'g self, key: &Q) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.map.remove(key, &self.guard)
    }

    /// Removes the entry for `key`, returning key and value; see
    /// [`HashMap::remove_entry`].
    pub fn remove_entry<'g, Q>(&'g self, key: &Q) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.map.remove_entry(key, &self.guard)
    }

    /// Removes the entry only if it maps to `expected`; see
    /// [`HashMap::remove_if`].
    pub fn remove_if<'g, Q>(&'g self, key: &Q, expected: &V) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
        V: PartialEq,
    {
        self.map.remove_if(key, expected, &self.guard)
    }

    /// Replaces the value of a present key; see [`HashMap::replace`].
    pub fn replace<'g, Q>(&'g self, key: &Q, value: V) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.map.replace(key, value, &self.guard)
    }

    /// Replaces the value only if it currently equals `expected`; see
    /// [`HashMap::replace_if`].
    pub fn replace_if<'g, Q>(&'g self, key: &Q, expected: &V, value: V) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
        V: PartialEq,
    {
        self.map.replace_if(key, expected, value, &self.guard)
    }

    /// Removes every entry; see [`HashMap::clear`].
    pub fn clear(&self) {
        self.map.clear(&self.guard)
    }

    /// Retains the entries the predicate approves of; see
    /// [`HashMap::retain`].
    pub fn retain<F>(&self, f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.map.retain(f, &self.guard)
    }

    /// Retains the entries the predicate approves of, unconditionally
    /// removing the rest; see [`HashMap::retain_force`].
    pub fn retain_force<F>(&self, f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.map.retain_force(f, &self.guard)
    }
}

impl<K, V, S> HashMapRef<'_, K, V, S>
where
    K: Clone + Ord,
{
    /// Pre-allocates room for `additional` more entries; see
    /// [`HashMap::reserve`].
    pub fn reserve(&self, additional: usize) {
        self.map.reserve(additional, &self.guard)
    }
}

impl<'g, K, V, S> IntoIterator for &'g HashMapRef<'_, K, V, S> {
    type IntoIter = Iter<'g, K, V>;
    type Item = (&'g K, &'g V);

    fn into_iter(self) -> Self::IntoIter {
        self.map.iter(&self.guard)
    }
}

impl<K, V, S> Debug for HashMapRef<'_, K, V, S>
where
    K: Debug,
    V: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S> PartialEq for HashMapRef<'_, K, V, S>
where
    K: Hash + Ord,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &Self) -> bool {
        self.map.guarded_eq(other.map, &self.guard, &other.guard)
    }
}

impl<K, V, S> PartialEq<HashMap<K, V, S>> for HashMapRef<'_, K, V, S>
where
    K: Hash + Ord,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &HashMap<K, V, S>) -> bool {
        self.map.guarded_eq(other, &self.guard, &other.guard())
    }
}

impl<K, V, S> Eq for HashMapRef<'_, K, V, S>
where
    K: Hash + Ord,
    V: Eq,
    S: BuildHasher,
{
}
