//! Prints a fresh 128-character hex secret for operator configuration,
//! e.g. `JWT_SECRET`. Not part of the running service.

use backend::auth::tokens::generate_secret;

fn main() {
    println!("{}", generate_secret());
}
