//! Dialects: the high-level `sys` dialect shared by the frontend and the
//! mid-level passes, and one machine dialect per target.

pub mod arm;
pub mod rv;
pub mod sys;
