pub mod flutterwave;
pub mod paypal;
pub mod paystack;
pub mod stripe;

pub use flutterwave::{FlutterwaveAdapter, FlutterwaveConfig};
pub use paypal::{PayPalAdapter, PayPalConfig};
pub use paystack::{PaystackAdapter, PaystackConfig};
pub use stripe::{StripeAdapter, StripeConfig};
