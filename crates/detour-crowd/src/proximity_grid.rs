//! Spatial hash for neighbour queries between crowd agents
//!
//! The grid is rebuilt from scratch every crowd update, so it only supports
//! insertion and lookup.

use std::collections::HashMap;

/// Agent data stored in the proximity grid
#[derive(Debug, Clone, Copy)]
pub struct GridAgent {
    pub id: usize,
    /// Position; only x and z are used
    pub pos: [f32; 3],
    pub radius: f32,
}

/// Proximity grid over the xz-plane
#[derive(Debug)]
pub struct ProximityGrid {
    cells: HashMap<(i32, i32), Vec<GridAgent>>,
    cell_size: f32,
    agent_count: usize,
}

impl ProximityGrid {
    pub fn new(cell_size: f32) -> Self {
        Self {
            cells: HashMap::new(),
            // Avoid division by zero
            cell_size: cell_size.max(0.1),
            agent_count: 0,
        }
    }

    fn coord(&self, x: f32, z: f32) -> (i32, i32) {
        (
            (x / self.cell_size).floor() as i32,
            (z / self.cell_size).floor() as i32,
        )
    }

    pub fn clear(&mut self) {
        self.cells.clear();
        self.agent_count = 0;
    }

    pub fn add_agent(&mut self, agent: GridAgent) {
        let key = self.coord(agent.pos[0], agent.pos[2]);
        self.cells.entry(key).or_default().push(agent);
        self.agent_count += 1;
    }

    /// Ids of the agents whose circle overlaps the circle at `pos`, nearest first
    pub fn query_agents(&self, pos: &[f32; 3], radius: f32, max_radius: f32) -> Vec<usize> {
        let reach = radius + max_radius;
        let (x0, z0) = self.coord(pos[0] - reach, pos[2] - reach);
        let (x1, z1) = self.coord(pos[0] + reach, pos[2] + reach);

        let mut found: Vec<(f32, usize)> = Vec::new();
        for z in z0..=z1 {
            for x in x0..=x1 {
                let Some(cell) = self.cells.get(&(x, z)) else {
                    continue;
                };
                for agent in cell {
                    let dx = agent.pos[0] - pos[0];
                    let dz = agent.pos[2] - pos[2];
                    let d = dx * dx + dz * dz;
                    let r = radius + agent.radius;
                    if d <= r * r {
                        found.push((d, agent.id));
                    }
                }
            }
        }
        found.sort_by(|a, b| a.0.total_cmp(&b.0));
        found.into_iter().map(|(_, id)| id).collect()
    }

    pub fn get_agent_count(&self) -> usize {
        self.agent_count
    }

    pub fn get_cell_size(&self) -> f32 {
        self.cell_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: usize, x: f32, z: f32) -> GridAgent {
        GridAgent {
            id,
            pos: [x, 0.0, z],
            radius: 0.5,
        }
    }

    #[test]
    fn test_query_spans_cells_and_sorts() {
        let mut grid = ProximityGrid::new(2.0);
        grid.add_agent(agent(1, 0.5, 0.5));
        grid.add_agent(agent(2, 2.5, 0.5));
        grid.add_agent(agent(3, -1.0, -1.0));
        grid.add_agent(agent(4, 20.0, 20.0));
        assert_eq!(grid.get_agent_count(), 4);

        let ids = grid.query_agents(&[1.8, 0.0, 0.5], 1.0, 0.5);
        assert_eq!(ids, vec![2, 1]);

        let ids = grid.query_agents(&[0.0, 0.0, 0.0], 3.0, 0.5);
        assert_eq!(ids.len(), 3);
        assert!(!ids.contains(&4));

        grid.clear();
        assert!(grid.query_agents(&[0.0; 3], 100.0, 0.5).is_empty());
    }
}
