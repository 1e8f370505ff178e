pub mod error;
pub mod leaderboard;
pub mod protocol;
pub mod room;
