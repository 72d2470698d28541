use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Weighted fair queue over flows keyed by `K`. Each flow carries a weight
/// (default 1.0); items are tagged at push with a virtual finish time
/// `max(V, F_prev) + size / weight`, and `pop` always yields the item with
/// the smallest head finish time, advancing the virtual clock to it. Flows
/// that stay busy therefore share the link in proportion to weight, and no
/// flow starves.
pub struct FairQueue<K: Eq + Hash + Clone, T> {
    flows: HashMap<K, Flow<T>>,
    virtual_time: f64,
    len: usize,
}

struct Flow<T> {
    items: VecDeque<(f64, usize, T)>,
    weight: f64,
    last_finish: f64,
}

impl<K: Eq + Hash + Clone, T> FairQueue<K, T> {
    pub fn new() -> Self {
        Self {
            flows: HashMap::new(),
            virtual_time: 0.0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set_weight(&mut self, key: &K, weight: f64) {
        let weight = if weight > 0.0 { weight } else { 1.0 };
        if let Some(flow) = self.flows.get_mut(key) {
            flow.weight = weight;
        } else {
            self.flows.insert(
                key.clone(),
                Flow { items: VecDeque::new(), weight, last_finish: 0.0 },
            );
        }
    }

    pub fn push(&mut self, key: K, size: usize, item: T) {
        let virtual_time = self.virtual_time;
        let flow = self.flows.entry(key).or_insert_with(|| Flow {
            items: VecDeque::new(),
            weight: 1.0,
            last_finish: 0.0,
        });
        let start = flow.last_finish.max(virtual_time);
        let finish = start + size as f64 / flow.weight;
        flow.last_finish = finish;
        flow.items.push_back((finish, size, item));
        self.len += 1;
    }

    /// Size in bytes of the item `pop` would return.
    pub fn front_size(&self) -> Option<usize> {
        self.flows
            .values()
            .filter_map(|f| f.items.front())
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|&(_, size, _)| size)
    }

    pub fn pop(&mut self) -> Option<(K, T)> {
        let key = self
            .flows
            .iter()
            .filter_map(|(k, f)| f.items.front().map(|&(finish, _, _)| (finish, k)))
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, k)| k.clone())?;
        let flow = self.flows.get_mut(&key).unwrap();
        let (finish, _, item) = flow.items.pop_front().unwrap();
        self.virtual_time = self.virtual_time.max(finish);
        self.len -= 1;
        Some((key, item))
    }

    /// Drop a flow and everything it still holds (e.g. an object that left).
    pub fn remove_flow(&mut self, key: &K) -> usize {
        match self.flows.remove(key) {
            Some(flow) => {
                let dropped = flow.items.len();
                self.len -= dropped;
                dropped
            }
            None => 0,
        }
    }
}

impl<K: Eq + Hash + Clone, T> Default for FairQueue<K, T> {
    fn default() -> Self {
        Self::new()
    }
}
