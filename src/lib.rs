//! Points and earned-time accounting for a family "earn and spend" system.
//!
//! Children earn points from time spent in designated learning apps and
//! redeem them for time-boxed access to reward apps. This crate is the
//! accounting core: usage-session accrual with idle-timeout exclusion and
//! daily caps, an append-only points ledger, a redemption service, an
//! exemption-window manager with timer-driven expiry, and a pairing-code
//! service binding child identities to devices.
//!
//! Usage detection, UI, cloud sync, and the shield that actually blocks
//! reward apps are external collaborators; they feed session events and
//! redemption requests in and consume ledger entries and time windows.

pub mod rewards;
