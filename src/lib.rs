// Reference-free methylation deconvolution

#![doc = include_str!("../README.md")]

pub mod bootstrap;
pub mod error;
pub mod factorization;
pub mod projection;
pub mod solvers;


pub use bootstrap::{binomial_deviance, bootstrap_deviance, select_k, DevianceTable};
pub use error::CellMixError;
pub use factorization::{
    fit, fit_array, svd_initial_factor, update_mu, update_omega, FactorModel, InitialFactor,
};
pub use projection::project;
