pub mod tree;
pub use tree::{NodeIndex, PhyloNode, Tree};

pub mod params;
pub use params::SearchParams;

pub mod placement;
pub use placement::{Placement, PlacementSite};

pub mod spr;
pub mod blength;
pub mod rates;
pub mod support;
