//! Ledger status vocabularies
//!
//! The ledger stores statuses as plain strings; these enums are the only
//! place the literal values live on the Rust side.

/// Lifecycle status of a wallet operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletOperationStatus {
    ToRerate,
    Open,
    Billed,
    Canceled,
    /// Rerating refused; the operation stays as billed
    FailedToRerate,
}

impl WalletOperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletOperationStatus::ToRerate => "TO_RERATE",
            WalletOperationStatus::Open => "OPEN",
            WalletOperationStatus::Billed => "BILLED",
            WalletOperationStatus::Canceled => "CANCELED",
            WalletOperationStatus::FailedToRerate => "F_TO_RERATE",
        }
    }
}

/// Lifecycle status of a rated transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatedTransactionStatus {
    Open,
    Billed,
    Canceled,
}

impl RatedTransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RatedTransactionStatus::Open => "OPEN",
            RatedTransactionStatus::Billed => "BILLED",
            RatedTransactionStatus::Canceled => "CANCELED",
        }
    }
}

/// Lifecycle status of an invoice line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceLineStatus {
    Open,
    Billed,
}

impl InvoiceLineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceLineStatus::Open => "OPEN",
            InvoiceLineStatus::Billed => "BILLED",
        }
    }
}

/// Lifecycle status of an event detail record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdrStatus {
    Open,
    Cancelled,
}

impl EdrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdrStatus::Open => "OPEN",
            EdrStatus::Cancelled => "CANCELLED",
        }
    }
}
