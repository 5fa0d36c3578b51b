use serde::{Deserialize, Serialize};

/// Closed set of expense categories accepted by every pathway.
///
/// The serde representation matches the wire strings exactly; anything else
/// fails deserialization, which is how rule files and LLM responses are
/// validated against the closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "Travel-Lodging")]
    TravelLodging,
    #[serde(rename = "Travel-Meals")]
    TravelMeals,
    #[serde(rename = "Travel-Taxes")]
    TravelTaxes,
    #[serde(rename = "Office-Supplies")]
    OfficeSupplies,
    #[serde(rename = "Fuel-Vehicle")]
    FuelVehicle,
    #[serde(rename = "Capital-Equipment")]
    CapitalEquipment,
    #[serde(rename = "Tax-GST/HST")]
    TaxGstHst,
    #[serde(rename = "Professional-Services")]
    ProfessionalServices,
    #[serde(rename = "Meals & Entertainment")]
    MealsEntertainment,
    #[serde(rename = "Uncategorized-Review-Required")]
    UncategorizedReviewRequired,
}

impl Category {
    /// All members, in a stable order
    pub const ALL: [Category; 10] = [
        Category::TravelLodging,
        Category::TravelMeals,
        Category::TravelTaxes,
        Category::OfficeSupplies,
        Category::FuelVehicle,
        Category::CapitalEquipment,
        Category::TaxGstHst,
        Category::ProfessionalServices,
        Category::MealsEntertainment,
        Category::UncategorizedReviewRequired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::TravelLodging => "Travel-Lodging",
            Category::TravelMeals => "Travel-Meals",
            Category::TravelTaxes => "Travel-Taxes",
            Category::OfficeSupplies => "Office-Supplies",
            Category::FuelVehicle => "Fuel-Vehicle",
            Category::CapitalEquipment => "Capital-Equipment",
            Category::TaxGstHst => "Tax-GST/HST",
            Category::ProfessionalServices => "Professional-Services",
            Category::MealsEntertainment => "Meals & Entertainment",
            Category::UncategorizedReviewRequired => "Uncategorized-Review-Required",
        }
    }

    /// Parse a wire string, rejecting anything outside the closed set
    pub fn parse(s: &str) -> Option<Category> {
        Category::ALL.iter().copied().find(|c| c.as_str() == s)
    }

    /// Categories that receive citations from the retrieval step.
    ///
    /// Uncategorized items are included so reviewers see the passages the
    /// model was shown.
    pub fn is_tax_relevant(&self) -> bool {
        matches!(
            self,
            Category::TravelLodging
                | Category::TravelMeals
                | Category::TravelTaxes
                | Category::MealsEntertainment
                | Category::OfficeSupplies
                | Category::ProfessionalServices
                | Category::FuelVehicle
                | Category::TaxGstHst
                | Category::UncategorizedReviewRequired
        )
    }

    /// Coarse expense-type hint handed to the retrieval layer
    pub fn retrieval_hint(&self) -> Option<&'static str> {
        match self {
            Category::TravelLodging => Some("lodging"),
            Category::TravelMeals | Category::MealsEntertainment => Some("meals"),
            Category::TravelTaxes | Category::TaxGstHst => Some("taxes"),
            Category::OfficeSupplies => Some("supplies"),
            Category::FuelVehicle => Some("vehicle"),
            Category::CapitalEquipment => Some("capital"),
            Category::ProfessionalServices => Some("services"),
            Category::UncategorizedReviewRequired => None,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
