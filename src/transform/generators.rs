//! The closed set of fake-value generators.
//!
//! Each generator is a pure function of its RNG: seeded identically, it
//! produces identical output across processes and platforms. The RNG is
//! either derived from the original value (deterministic mode, the
//! default) or from OS entropy (`:random` columns).

use fake::Fake;
use fake::faker::address::en::{BuildingNumber, CityName, StreetName, ZipCode};
use fake::faker::company::en::CompanyName;
use fake::faker::creditcard::en::CreditCardNumber;
use fake::faker::internet::en::{FreeEmail, Username};
use fake::faker::name::en::{FirstName, LastName, Name};
use fake::faker::number::en::NumberWithFormat;
use fake::faker::phone_number::en::PhoneNumber;
use rand::Rng;
use rand::rngs::StdRng;

/// Names accepted in the transform YAML. The set is closed: config
/// validation rejects anything else at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformKind {
    FullName,
    FirstName,
    LastName,
    Email,
    UserName,
    Phone,
    Ssn,
    DateOfBirth,
    CreditCardNum,
    StreetAddress,
    City,
    ZipCode,
    CompanyName,
    Password,
}

impl TransformKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "FullName" => TransformKind::FullName,
            "FirstName" => TransformKind::FirstName,
            "LastName" => TransformKind::LastName,
            "Email" => TransformKind::Email,
            "UserName" => TransformKind::UserName,
            "Phone" => TransformKind::Phone,
            "SSN" => TransformKind::Ssn,
            "DateOfBirth" => TransformKind::DateOfBirth,
            "CreditCardNum" => TransformKind::CreditCardNum,
            "StreetAddress" => TransformKind::StreetAddress,
            "City" => TransformKind::City,
            "ZipCode" => TransformKind::ZipCode,
            "CompanyName" => TransformKind::CompanyName,
            "Password" => TransformKind::Password,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransformKind::FullName => "FullName",
            TransformKind::FirstName => "FirstName",
            TransformKind::LastName => "LastName",
            TransformKind::Email => "Email",
            TransformKind::UserName => "UserName",
            TransformKind::Phone => "Phone",
            TransformKind::Ssn => "SSN",
            TransformKind::DateOfBirth => "DateOfBirth",
            TransformKind::CreditCardNum => "CreditCardNum",
            TransformKind::StreetAddress => "StreetAddress",
            TransformKind::City => "City",
            TransformKind::ZipCode => "ZipCode",
            TransformKind::CompanyName => "CompanyName",
            TransformKind::Password => "Password",
        }
    }
}

/// Produce a fake value for every kind except `Password`, which needs
/// the original cleartext and lives in [`crate::transform::password`].
///
/// All generators emit text; the engine handles coercion to the column's
/// value class.
pub fn generate(kind: TransformKind, rng: &mut StdRng) -> String {
    match kind {
        TransformKind::FullName => Name().fake_with_rng(rng),
        TransformKind::FirstName => FirstName().fake_with_rng(rng),
        TransformKind::LastName => LastName().fake_with_rng(rng),
        TransformKind::Email => FreeEmail().fake_with_rng(rng),
        TransformKind::UserName => Username().fake_with_rng(rng),
        TransformKind::Phone => PhoneNumber().fake_with_rng(rng),
        TransformKind::Ssn => NumberWithFormat("###-##-####").fake_with_rng(rng),
        TransformKind::DateOfBirth => date_of_birth(rng),
        TransformKind::CreditCardNum => CreditCardNumber().fake_with_rng(rng),
        TransformKind::StreetAddress => {
            let number: String = BuildingNumber().fake_with_rng(rng);
            let street: String = StreetName().fake_with_rng(rng);
            format!("{number} {street}")
        }
        TransformKind::City => CityName().fake_with_rng(rng),
        TransformKind::ZipCode => ZipCode().fake_with_rng(rng),
        TransformKind::CompanyName => CompanyName().fake_with_rng(rng),
        TransformKind::Password => unreachable!("password transform handled separately"),
    }
}

/// An ISO date between 1950-01-01 and 2004-12-31.
fn date_of_birth(rng: &mut StdRng) -> String {
    let year: i32 = rng.random_range(1950..2005);
    let month: u32 = rng.random_range(1..=12);
    let day: u32 = rng.random_range(1..=days_in_month(year, month));
    format!("{year:04}-{month:02}-{day:02}")
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 => 29,
        _ => 28,
    }
}
