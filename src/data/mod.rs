pub mod embedding;
pub mod graph;
pub mod nearest_neighbours;
pub mod structures;
pub mod synthetic;
