pub mod checksum;
pub mod guard;
pub mod health;
pub mod htsp;
pub mod mailer;
pub mod schedule;
pub mod system;
pub mod transfer;
