/// The kind of quantity carried by a register.
///
/// The H60 gateway encodes this in the leading character of the register index, so this is
/// always derived from the index and never stored alongside it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum DataType {
    Degrees,
    OnOff,
    Number,
    Percent,
    Ampere,
    KiloWattHours,
    Hours,
    Minutes,
    DegreeMinutes,
    KiloWatts,
}

/// How the raw wire value of a [`DataType`] maps onto an engineering value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    /// Integer holding the value multiplied by 10.
    Tenths,
    /// Integer holding the value multiplied by 100.
    Hundredths,
    /// Integer, any non-zero value is `true`.
    Boolean,
    /// Integer taken as-is.
    Count,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("could not identify the data type of register `{0}`")]
pub struct ClassificationError(pub String);

impl DataType {
    const fn from_leading_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            b'0' => Self::Degrees,
            b'1' => Self::OnOff,
            b'2' | b'B' => Self::Number,
            b'3' => Self::Percent,
            b'4' => Self::Ampere,
            b'5' => Self::KiloWattHours,
            b'6' => Self::Hours,
            b'7' => Self::Minutes,
            b'8' => Self::DegreeMinutes,
            b'9' => Self::KiloWatts,
            _ => return None,
        })
    }

    /// Like [`Self::classify`] but usable in constant context.
    pub const fn from_index(id: &str) -> Option<Self> {
        match id.as_bytes().first() {
            Some(&byte) => Self::from_leading_byte(byte),
            None => None,
        }
    }

    pub fn classify(id: &str) -> Result<Self, ClassificationError> {
        Self::from_index(id).ok_or_else(|| ClassificationError(id.to_string()))
    }

    pub const fn encoding(self) -> Encoding {
        match self {
            Self::Degrees | Self::Percent | Self::Ampere => Encoding::Tenths,
            Self::KiloWattHours => Encoding::Hundredths,
            Self::OnOff => Encoding::Boolean,
            Self::Number | Self::Hours | Self::Minutes | Self::DegreeMinutes | Self::KiloWatts => {
                Encoding::Count
            }
        }
    }

    pub const fn unit(self) -> &'static str {
        match self {
            Self::Degrees => "°C",
            Self::OnOff | Self::Number => "",
            Self::Percent => "%",
            Self::Ampere => "A",
            Self::KiloWattHours => "kWh",
            Self::Hours => "h",
            Self::Minutes => "min",
            Self::DegreeMinutes => "°min",
            Self::KiloWatts => "kW",
        }
    }
}

impl Encoding {
    pub const fn scale(self) -> u8 {
        match self {
            Self::Tenths => 10,
            Self::Hundredths => 100,
            Self::Boolean | Self::Count => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Register {
    id: &'static str,
    name: &'static str,
    description: &'static str,
}

impl Register {
    const fn new(id: &'static str, name: &'static str, description: &'static str) -> Self {
        Self { id, name, description }
    }

    pub fn from_id(id: &str) -> Option<Register> {
        c30::ALL.iter().copied().find(|r| r.id == id)
    }

    pub fn from_name(name: &str) -> Option<Register> {
        c30::ALL.iter().copied().find(|r| r.name.eq_ignore_ascii_case(name))
    }

    /// The wire index of this register, e.g. `0203`.
    pub const fn id(&self) -> &'static str {
        self.id
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn description(&self) -> &'static str {
        self.description
    }

    pub const fn data_type(&self) -> DataType {
        match DataType::from_index(self.id) {
            Some(data_type) => data_type,
            None => panic!("catalog registers always classify"),
        }
    }
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{} ({})", self.name, self.id))
    }
}

macro_rules! catalog {
    ($($id: literal => $name: ident, $description: literal;)*) => {
        $(pub const $name: Register = Register::new($id, stringify!($name), $description);)*

        pub const ALL: &[Register] = &[$($name),*];
    }
}

/// Registers of the IVT Rego 1000 and Bosch Pro Control 500 controllers (Husdata C30 table).
pub mod c30 {
    use super::Register;

    catalog! {
        "0002" => RADIATOR_FORWARD, "Radiator forward line temperature";
        "0003" => HEAT_CARRIER_RETURN, "Heat carrier return line temperature";
        "0004" => HEAT_CARRIER_FORWARD, "Heat carrier forward line temperature";
        "0005" => BRINE_IN_EVAPORATOR, "Brine temperature into the evaporator";
        "0006" => BRINE_OUT_CONDENSER, "Brine temperature out of the condenser";
        "0007" => OUTDOOR, "Outdoor temperature as sensed by the controller";
        "0008" => INDOOR, "Indoor temperature from the room sensor";
        "0009" => WARM_WATER_1_TOP, "Warm water tank top temperature";
        "000B" => HOT_GAS_COMPRESSOR, "Compressor hot gas temperature";
        "000E" => AIR_INTAKE, "Air intake temperature";
        "0011" => POOL, "Pool temperature";
        "0021" => INDOOR_2, "Indoor temperature from the second room sensor";
        "1A01" => COMPRESSOR, "Compressor running";
        "1A04" => PUMP_COLD_CIRCUIT, "Cold circuit pump running";
        "1A05" => PUMP_HEAT_CIRCUIT, "Heat circuit pump running";
        "1A06" => PUMP_RADIATOR, "Radiator pump running";
        "1A07" => SWITCH_VALVE_1, "Switch valve 1 open";
        "1A08" => SWITCH_VALVE_2, "Switch valve 2 open";
        "1A09" => FAN, "Fan running";
        "1A0A" => HIGH_PRESSOSTAT, "High pressure switch tripped";
        "1A0B" => LOW_PRESSOSTAT, "Low pressure switch tripped";
        "1A0C" => HEATING_CABLE, "Heating cable on";
        "1A0D" => CRANK_CASE_HEATER, "Crank case heater on";
        "3104" => ADD_HEAT_STATUS, "Additional heat output";
        "0111" => WARM_WATER_SETPOINT, "Warm water setpoint";
        "0107" => HEATING_SETPOINT, "Heating forward line setpoint computed by the controller";
        "1A20" => ALARM, "Alarm active";
        "1A21" => PUMP_RADIATOR_2, "Second radiator pump running";
        "0203" => ROOM_TEMP_SETPOINT, "Indoor temperature setpoint";
        "2204" => ROOM_SENSOR_INFLUENCE, "Room sensor influence on the heat curve";
        "0205" => HEAT_SET_1_CURVE_L, "Heat curve 1 slope";
        "0206" => HEAT_SET_2_CURVE_R, "Heat curve 2 slope";
        "6209" => EXTRA_WARM_WATER, "Extra warm water duration";
        "1210" => HOLIDAY_MODE, "Holiday mode";
        "B20A" => SUMMER_MODE, "Summer mode";
        "2213" => WARM_WATER_PROGRAM, "Warm water program";
        "2233" => EXTERNAL_CONTROL, "External control";
        "2234" => EXTERNAL_CONTROL_2, "External control 2";
        "0217" => OUTDOOR_TEMP_OFFSET, "Offset applied to the sensed outdoor temperature";
        "0222" => HEAT_SET_1_CURVE_L_2, "Heat curve 1 parallel offset";
        "0223" => HEAT_SET_2_CURVE_R_2, "Heat curve 2 parallel offset";
        "0219" => POOL_TEMP_SETPOINT, "Pool temperature setpoint";
        "5C52" => SUPP_ENERGY_HEATING, "Supplied energy for heating";
        "5C53" => SUPP_ENERGY_HOTWATER, "Supplied energy for warm water";
        "5C55" => COMPR_CONS_HEATING, "Compressor consumption for heating";
        "5C56" => COMPR_CONS_HOTWATER, "Compressor consumption for warm water";
        "5C58" => AUX_CONS_HEATING, "Auxiliary heater consumption for heating";
        "5C59" => AUX_CONS_HOTWATER, "Auxiliary heater consumption for warm water";
        "2F00" => PROG_VER_MAJOR, "Controller software major version";
        "2F01" => PROG_VER_MINOR, "Controller software minor version";
        "2F02" => PROG_VER_REVISION, "Controller software revision";
    }
}

const _ASSERT_CATALOG_CLASSIFIES: () = const {
    let mut idx = 0;
    while idx < c30::ALL.len() {
        assert!(
            DataType::from_index(c30::ALL[idx].id).is_some(),
            "every catalog register must have a known data type"
        );
        idx += 1;
    }
};
