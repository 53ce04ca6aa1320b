//! RIF domain types shared across the workspace

use serde::{Deserialize, Serialize};

use crate::error::CommonError;

/// The categories of RIF files that can appear in a CCW data set.
///
/// The wire values (manifest `type` attribute, database columns) use the
/// SCREAMING_SNAKE names from the CCW manifest schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RifFileType {
    Beneficiary,
    BeneficiaryHistory,
    Carrier,
    Dme,
    Hha,
    Hospice,
    Inpatient,
    Outpatient,
    Pde,
    Snf,
}

impl RifFileType {
    /// All known file types, in manifest schema order.
    pub const ALL: [RifFileType; 10] = [
        RifFileType::Beneficiary,
        RifFileType::BeneficiaryHistory,
        RifFileType::Carrier,
        RifFileType::Dme,
        RifFileType::Hha,
        RifFileType::Hospice,
        RifFileType::Inpatient,
        RifFileType::Outpatient,
        RifFileType::Pde,
        RifFileType::Snf,
    ];

    /// The manifest/database representation of this file type.
    pub fn as_str(&self) -> &'static str {
        match self {
            RifFileType::Beneficiary => "BENEFICIARY",
            RifFileType::BeneficiaryHistory => "BENEFICIARY_HISTORY",
            RifFileType::Carrier => "CARRIER",
            RifFileType::Dme => "DME",
            RifFileType::Hha => "HHA",
            RifFileType::Hospice => "HOSPICE",
            RifFileType::Inpatient => "INPATIENT",
            RifFileType::Outpatient => "OUTPATIENT",
            RifFileType::Pde => "PDE",
            RifFileType::Snf => "SNF",
        }
    }
}

impl std::fmt::Display for RifFileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RifFileType {
    type Err = CommonError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        RifFileType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CommonError::UnknownFileType(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_type_round_trips_through_wire_form() {
        for file_type in RifFileType::ALL {
            let parsed: RifFileType = file_type.as_str().parse().unwrap();
            assert_eq!(file_type, parsed);
        }
    }

    #[test]
    fn unknown_file_type_is_rejected() {
        let result = "CLAIMS".parse::<RifFileType>();
        assert!(matches!(result, Err(CommonError::UnknownFileType(_))));
    }

    #[test]
    fn serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&RifFileType::BeneficiaryHistory).unwrap();
        assert_eq!(json, "\"BENEFICIARY_HISTORY\"");
    }
}
