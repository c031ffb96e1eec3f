//! Static universe topology.
//!
//! The graph is an undirected adjacency list over solar systems keyed by
//! system id; ids are the only cross-references, so the whole structure is
//! freely shareable across tasks. All edges are unit weight, which makes BFS
//! optimal for every distance query.

pub mod catalog;

pub use catalog::{Catalog, ItemType, Station};

use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use crate::error::{FlipperError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct SolarSystem {
    pub system_id: i32,
    pub name: String,
    pub region_id: i32,
    /// Security rating in [-1.0, 1.0].
    pub security: f64,
}

#[derive(Debug, Default)]
pub struct Universe {
    systems: HashMap<i32, SolarSystem>,
    adjacency: HashMap<i32, Vec<i32>>,
    region_names: HashMap<i32, String>,
}

#[derive(Deserialize)]
struct UniverseFile {
    systems: Vec<SolarSystem>,
    /// Undirected edges as `[a, b]` system-id pairs.
    edges: Vec<(i32, i32)>,
    #[serde(default)]
    regions: HashMap<i32, String>,
}

impl Universe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the graph from the static-data JSON file in the cache directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FlipperError::Fatal(format!("read {}: {e}", path.display())))?;
        let file: UniverseFile = serde_json::from_str(&raw)?;
        let mut universe = Self::new();
        for system in file.systems {
            universe.insert_system(system);
        }
        for (a, b) in file.edges {
            universe.connect(a, b);
        }
        universe.region_names = file.regions;
        Ok(universe)
    }

    pub fn insert_system(&mut self, system: SolarSystem) {
        self.adjacency.entry(system.system_id).or_default();
        self.systems.insert(system.system_id, system);
    }

    /// Adds an undirected edge. Duplicate edges are ignored.
    pub fn connect(&mut self, a: i32, b: i32) {
        if a == b {
            return;
        }
        let fwd = self.adjacency.entry(a).or_default();
        if !fwd.contains(&b) {
            fwd.push(b);
        }
        let rev = self.adjacency.entry(b).or_default();
        if !rev.contains(&a) {
            rev.push(a);
        }
    }

    pub fn set_region_name(&mut self, region_id: i32, name: &str) {
        self.region_names.insert(region_id, name.to_string());
    }

    pub fn system(&self, system_id: i32) -> Option<&SolarSystem> {
        self.systems.get(&system_id)
    }

    pub fn system_by_name(&self, name: &str) -> Option<&SolarSystem> {
        self.systems.values().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn system_name(&self, system_id: i32) -> String {
        self.systems
            .get(&system_id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| format!("System {system_id}"))
    }

    pub fn region_of(&self, system_id: i32) -> Option<i32> {
        self.systems.get(&system_id).map(|s| s.region_id)
    }

    pub fn region_name(&self, region_id: i32) -> String {
        self.region_names
            .get(&region_id)
            .cloned()
            .unwrap_or_else(|| format!("Region {region_id}"))
    }

    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    fn passes_floor(&self, system_id: i32, min_security: f64) -> bool {
        if min_security <= 0.0 {
            return true;
        }
        match self.systems.get(&system_id) {
            Some(s) => s.security >= min_security,
            None => false,
        }
    }

    /// All systems reachable from `origin` within `max_jumps`, mapped to
    /// their BFS distance. With a positive `min_security`, every system on
    /// the path (excluding the origin itself) must meet the floor.
    pub fn systems_within(
        &self,
        origin: i32,
        max_jumps: u32,
        min_security: f64,
    ) -> HashMap<i32, u32> {
        let mut dist = HashMap::new();
        dist.insert(origin, 0u32);
        let mut queue = VecDeque::from([origin]);

        while let Some(current) = queue.pop_front() {
            let d = dist[&current];
            if d >= max_jumps {
                continue;
            }
            for &neighbor in self.adjacency.get(&current).map(Vec::as_slice).unwrap_or(&[]) {
                if !self.passes_floor(neighbor, min_security) {
                    continue;
                }
                if !dist.contains_key(&neighbor) {
                    dist.insert(neighbor, d + 1);
                    queue.push_back(neighbor);
                }
            }
        }
        dist
    }

    /// Shortest jump count between two systems, or `None` when unreachable.
    /// A positive `min_security` restricts the path to systems meeting the
    /// floor, endpoints included.
    pub fn shortest_path(&self, origin: i32, dest: i32, min_security: f64) -> Option<u32> {
        if origin == dest {
            return Some(0);
        }
        if min_security > 0.0
            && (!self.passes_floor(origin, min_security) || !self.passes_floor(dest, min_security))
        {
            return None;
        }

        let mut dist = HashMap::new();
        dist.insert(origin, 0u32);
        let mut queue = VecDeque::from([origin]);

        while let Some(current) = queue.pop_front() {
            let d = dist[&current];
            for &neighbor in self.adjacency.get(&current).map(Vec::as_slice).unwrap_or(&[]) {
                if !self.passes_floor(neighbor, min_security) {
                    continue;
                }
                if !dist.contains_key(&neighbor) {
                    if neighbor == dest {
                        return Some(d + 1);
                    }
                    dist.insert(neighbor, d + 1);
                    queue.push_back(neighbor);
                }
            }
        }
        None
    }

    /// Unique region ids for a set of systems.
    pub fn regions_in_set(&self, systems: &HashMap<i32, u32>) -> HashSet<i32> {
        systems
            .keys()
            .filter_map(|id| self.region_of(*id))
            .collect()
    }

    /// All systems belonging to any of the given regions, with distance 0.
    /// Used for whole-region sweeps where the jump radius is not the bound.
    pub fn systems_in_regions(&self, regions: &HashSet<i32>) -> HashMap<i32, u32> {
        self.systems
            .values()
            .filter(|s| regions.contains(&s.region_id))
            .map(|s| (s.system_id, 0))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sys(id: i32, region: i32, security: f64) -> SolarSystem {
        SolarSystem {
            system_id: id,
            name: format!("S{id}"),
            region_id: region,
            security,
        }
    }

    /// Line: 1 - 2 - 3 - 4, plus a lowsec detour 2 - 5 - 4.
    fn line_universe() -> Universe {
        let mut u = Universe::new();
        for (id, sec) in [(1, 0.9), (2, 0.8), (3, 0.7), (4, 0.6), (5, 0.4)] {
            u.insert_system(sys(id, 10, sec));
        }
        u.connect(1, 2);
        u.connect(2, 3);
        u.connect(3, 4);
        u.connect(2, 5);
        u.connect(5, 4);
        u
    }

    #[test]
    fn radius_zero_is_origin_only() {
        let u = line_universe();
        let within = u.systems_within(1, 0, 0.0);
        assert_eq!(within.len(), 1);
        assert_eq!(within[&1], 0);
    }

    #[test]
    fn radius_distances() {
        let u = line_universe();
        let within = u.systems_within(1, 2, 0.0);
        assert_eq!(within[&1], 0);
        assert_eq!(within[&2], 1);
        assert_eq!(within[&3], 2);
        assert_eq!(within[&5], 2);
        assert!(!within.contains_key(&4));
    }

    #[test]
    fn shortest_path_is_symmetric() {
        let u = line_universe();
        for (a, b) in [(1, 4), (2, 4), (1, 5), (3, 5)] {
            assert_eq!(u.shortest_path(a, b, 0.0), u.shortest_path(b, a, 0.0));
        }
        assert_eq!(u.shortest_path(1, 1, 0.0), Some(0));
    }

    #[test]
    fn security_floor_never_shortens() {
        let u = line_universe();
        // 2 -> 4 via lowsec 5 is 2 jumps; via 3 is also 2. Floor 0.5 drops 5.
        let open = u.shortest_path(2, 4, 0.0).unwrap();
        let filtered = u.shortest_path(2, 4, 0.5).unwrap();
        assert!(filtered >= open);
    }

    #[test]
    fn security_floor_excludes_low_systems() {
        let u = line_universe();
        let within = u.systems_within(1, 3, 0.5);
        assert!(!within.contains_key(&5));
        assert!(within.contains_key(&4));

        // An unreachable destination behind the floor.
        let mut u2 = Universe::new();
        u2.insert_system(sys(1, 10, 0.9));
        u2.insert_system(sys(2, 10, 0.3));
        u2.insert_system(sys(3, 10, 0.9));
        u2.connect(1, 2);
        u2.connect(2, 3);
        assert_eq!(u2.shortest_path(1, 3, 0.5), None);
        assert_eq!(u2.shortest_path(1, 3, 0.0), Some(2));
    }

    #[test]
    fn regions_and_region_sweep() {
        let mut u = Universe::new();
        u.insert_system(sys(1, 10, 0.9));
        u.insert_system(sys(2, 10, 0.9));
        u.insert_system(sys(3, 20, 0.9));
        u.connect(1, 2);
        u.connect(2, 3);

        let within = u.systems_within(1, 1, 0.0);
        let regions = u.regions_in_set(&within);
        assert_eq!(regions, HashSet::from([10]));

        let sweep = u.systems_in_regions(&HashSet::from([10]));
        assert_eq!(sweep.len(), 2);
        assert!(sweep.contains_key(&1) && sweep.contains_key(&2));
    }

    #[test]
    fn disconnected_is_unreachable() {
        let mut u = Universe::new();
        u.insert_system(sys(1, 10, 0.9));
        u.insert_system(sys(2, 20, 0.9));
        assert_eq!(u.shortest_path(1, 2, 0.0), None);
        assert_eq!(u.systems_within(1, 5, 0.0).len(), 1);
    }
}
