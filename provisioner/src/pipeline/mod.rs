pub mod control;
pub mod controller;
pub mod fsm;
pub mod outcome;
pub mod plan;
