pub mod tsne_optimiser;
