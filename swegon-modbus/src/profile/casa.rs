//! Swegon CASA register map.
//!
//! Every CASA model shares [`BASE`]. A variant lists only the fields whose definition differs.

use super::{Group, Override, RegisterDefinition as R, Table};

pub(super) struct Variant {
    pub id: &'static str,
    pub overrides: &'static [Override],
}

pub(super) const VARIANTS: &[Variant] = &[
    Variant {
        id: "casa_r4",
        overrides: &[],
    },
    Variant {
        id: "casa_r15",
        // R15 reports the temperature setpoint in whole degrees.
        overrides: &[Override {
            group: Group::Setpoints,
            key: "Temp_SP",
            definition: R::new(5100),
        }],
    },
];

pub(super) const BASE: Table = &[
    (
        Group::Commands,
        &[
            ("Op_Mode", R::new(5000)),
            ("Fireplace_Mode", R::new(5001)),
            ("Unused", R::new(5002)),
            ("Travelling_Mode", R::new(5003)),
        ],
    ),
    (Group::Setpoints, &[("Temp_SP", R::scaled(5100, 0.1))]),
    (
        Group::Config,
        &[
            ("Fireplace_Run_Time", R::new(5103)),
            ("Fireplace_Max_Speed_Difference", R::new(5104)),
            ("Travelling_Mode_Speed_Drop", R::new(5105)),
        ],
    ),
    (
        Group::NightCooling,
        &[
            ("Night_Cooling", R::new(5163)),
            ("Night_Cooling_FreshAir_Max", R::new(5164)),
            ("Night_Cooling_FreshAir_Start", R::new(5165)),
            ("Night_Cooling_RoomTemp_Start", R::new(5166)),
            ("Night_Cooling_SupplyTemp_Min", R::new(5167)),
        ],
    ),
    (Group::AlarmReset, &[("Reset_Alarms", R::new(5406))]),
    // One 47 register block; the text fields run 15 and 24 registers from their start address.
    (
        Group::DeviceInfo,
        &[
            ("FW_Maj", R::new(6000)),
            ("FW_Min", R::new(6001)),
            ("FW_Build", R::new(6002)),
            ("Par_Maj", R::new(6003)),
            ("Par_Min", R::new(6004)),
            ("Model_Name", R::new(6007)),
            ("Serial_Number", R::new(6023)),
        ],
    ),
    (
        Group::Alarms,
        &[
            ("T1_Failure", R::new(6100)),
            ("T2_Failure", R::new(6101)),
            ("T3_Failure", R::new(6102)),
            ("T4_Failure", R::new(6103)),
            ("T5_Failure", R::new(6104)),
            ("T6_Failure", R::new(6105)),
            ("T7_Failure", R::new(6106)),
            ("T8_Failure", R::new(6107)),
            ("T1_Failure_Unconf", R::new(6108)),
            ("T2_Failure_Unconf", R::new(6109)),
            ("T3_Failure_Unconf", R::new(6110)),
            ("T4_Failure_Unconf", R::new(6111)),
            ("T5_Failure_Unconf", R::new(6112)),
            ("T6_Failure_Unconf", R::new(6113)),
            ("T7_Failure_Unconf", R::new(6114)),
            ("T8_Failure_Unconf", R::new(6115)),
            ("Afterheater_Failure", R::new(6116)),
            ("Afterheater_Failure_Unconf", R::new(6117)),
            ("Preheater_Failure", R::new(6118)),
            ("Preheater_Failure_Unconf", R::new(6119)),
            ("Freezing_Danger", R::new(6120)),
            ("Freezing_Danger_Unconf", R::new(6121)),
            ("Internal_Error", R::new(6122)),
            ("Internal_Error_Unconf", R::new(6123)),
            ("Supply_Fan_Failure", R::new(6124)),
            ("Supply_Fan_Failure_Unconf", R::new(6125)),
            ("Exhaust_Fan_Failure", R::new(6126)),
            ("Exhaust_Fan_Failure_Unconf", R::new(6127)),
            ("Service_Info", R::new(6128)),
            ("Filter_Guard_Info", R::new(6129)),
            ("Emergency_Stop", R::new(6130)),
            ("Active_Alarms", R::new(6131)),
            ("Info_Unconf", R::new(6132)),
        ],
    ),
    (
        Group::Sensors,
        &[
            ("Fresh_Temp", R::scaled(6200, 0.1)),
            ("Supply_Temp1", R::scaled(6201, 0.1)),
            ("Supply_Temp2", R::scaled(6202, 0.1)),
            ("Extract_Temp", R::scaled(6203, 0.1)),
            ("Exhaust_Temp", R::scaled(6204, 0.1)),
            ("Room_Temp", R::scaled(6205, 0.1)),
            ("UP1_Temp", R::scaled(6206, 0.1)),
            ("UP2_Temp", R::scaled(6207, 0.1)),
            ("WR_Temp", R::scaled(6208, 0.1)),
            ("PreHeat_Temp", R::scaled(6209, 0.1)),
            ("ExtFresh_Temp", R::scaled(6210, 0.1)),
            ("C02_Unf", R::new(6211)),
            ("CO2_Fil", R::new(6212)),
            ("RH", R::new(6213)),
            ("AH", R::scaled(6214, 0.1)),
            ("AH_SP", R::scaled(6215, 0.1)),
            ("VOC", R::new(6216)),
            ("Supply_Pressure", R::new(6217)),
            ("Exhaust_Pressure", R::new(6218)),
            ("Supply_Flow", R::scaled(6219, 3.6)),
            ("Exhaust_Flow", R::scaled(6220, 3.6)),
        ],
    ),
    (Group::Sensors2, &[("Heat_Exchanger", R::new(6233))]),
    (Group::VirtualSensors, &[("Efficiency", R::derived())]),
    (
        Group::UnitStatuses,
        &[
            ("Unit_state", R::new(6300)),
            ("Speed_state", R::new(6301)),
            ("Supply_Fan", R::new(6302)),
            ("Exhaust_Fan", R::new(6303)),
            ("Supply_Fan_RPM", R::new(6304)),
            ("Exhaust_Fan_RPM", R::new(6305)),
            ("NotUsed1", R::new(6306)),
            ("NotUsed2", R::new(6307)),
            ("NotUsed3", R::new(6308)),
            ("NotUsed4", R::new(6309)),
            ("NotUsed5", R::new(6310)),
            ("NotUsed6", R::new(6311)),
            ("NotUsed7", R::new(6312)),
            ("NotUsed8", R::new(6313)),
            ("NotUsed9", R::new(6314)),
            ("Temp_SP2", R::new(6315)),
            ("Heating_Output", R::new(6316)),
        ],
    ),
];
