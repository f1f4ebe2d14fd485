//! Nuimoコントローラーのプロトコル定義
//!
//! GATTのUUID、LEDマトリクスのエンコード、センサー通知のジェスチャーデコード

use ::uuid::Uuid;
use serde::{Deserialize, Serialize};

/// Bluetooth UUID定義
pub mod uuid {
    use ::uuid::Uuid;

    /// バッテリーサービス
    pub const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
    pub const BATTERY_CHAR: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

    /// デバイス情報サービス
    pub const DEVICE_INFORMATION_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
    pub const DEVICE_INFORMATION_CHAR: Uuid = Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);

    /// LEDマトリクス
    pub const LED_MATRIX_SERVICE: Uuid = Uuid::from_u128(0xf29b1523_cb19_40f3_be5c_7241ecb82fd1);
    pub const LED_MATRIX_CHAR: Uuid = Uuid::from_u128(0xf29b1524_cb19_40f3_be5c_7241ecb82fd1);

    /// センサー
    pub const SENSOR_SERVICE: Uuid = Uuid::from_u128(0xf29b1525_cb19_40f3_be5c_7241ecb82fd2);
    pub const SENSOR_FLY_CHAR: Uuid = Uuid::from_u128(0xf29b1526_cb19_40f3_be5c_7241ecb82fd2);
    pub const SENSOR_TOUCH_CHAR: Uuid = Uuid::from_u128(0xf29b1527_cb19_40f3_be5c_7241ecb82fd2);
    pub const SENSOR_ROTATION_CHAR: Uuid = Uuid::from_u128(0xf29b1528_cb19_40f3_be5c_7241ecb82fd2);
    pub const SENSOR_BUTTON_CHAR: Uuid = Uuid::from_u128(0xf29b1529_cb19_40f3_be5c_7241ecb82fd2);

    /// 接続時に通知を有効化するキャラクタリスティック
    pub const NOTIFICATION_CHARS: [Uuid; 4] = [
        SENSOR_FLY_CHAR,
        SENSOR_TOUCH_CHAR,
        SENSOR_ROTATION_CHAR,
        SENSOR_BUTTON_CHAR,
    ];
}

/// デフォルトのデバイス名
pub const NUIMO_DEVICE_NAME: &str = "Nuimo";

/// LEDの数（9x9）
pub const LED_COUNT: usize = 81;

/// 消灯とみなす文字
const LED_OFF_CHARS: [char; 2] = [' ', '0'];

/// 輝度バイト（常に最大）
const LED_BRIGHTNESS: u8 = 0xFF;

/// 9x9 LEDマトリクス
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedMatrix {
    bits: [bool; LED_COUNT],
}

impl LedMatrix {
    /// パターン文字列から作成
    ///
    /// 左上から行優先で1文字1LED。`' '`と`'0'`が消灯、それ以外は点灯。
    /// 81文字に満たない分は消灯で埋め、超えた分は無視する。
    pub fn from_pattern(pattern: &str) -> Self {
        let mut bits = [false; LED_COUNT];
        for (bit, c) in bits.iter_mut().zip(pattern.chars()) {
            *bit = !LED_OFF_CHARS.contains(&c);
        }
        LedMatrix { bits }
    }

    /// ビットマスクから作成（下位ビットから順にLED 0, 1, ...）
    pub fn from_mask(mask: u8) -> Self {
        let mut bits = [false; LED_COUNT];
        for (i, bit) in bits.iter_mut().take(8).enumerate() {
            *bit = mask & (1 << i) != 0;
        }
        LedMatrix { bits }
    }

    /// 内蔵の「ビジー」表示
    pub fn busy() -> Self {
        Self::from_mask(1)
    }

    /// 全消灯
    pub fn blank() -> Self {
        LedMatrix { bits: [false; LED_COUNT] }
    }

    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    /// 点灯しているLEDの数
    pub fn lit_count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    /// GATT書き込み用のバイト列にエンコード
    ///
    /// 8LEDごとに1バイト（LSBファースト、計11バイト）、続いて輝度と
    /// 表示時間（0.1秒単位、0〜255に丸め）。
    pub fn gatt_bytes(&self, display_interval_secs: f64) -> Vec<u8> {
        let mut data: Vec<u8> = self
            .bits
            .chunks(8)
            .map(|chunk| {
                chunk
                    .iter()
                    .enumerate()
                    .fold(0u8, |acc, (i, on)| if *on { acc | (1 << i) } else { acc })
            })
            .collect();

        data.push(LED_BRIGHTNESS);
        data.push(display_interval_byte(display_interval_secs));
        data
    }
}

impl Default for LedMatrix {
    fn default() -> Self {
        Self::blank()
    }
}

fn display_interval_byte(secs: f64) -> u8 {
    if secs.is_nan() {
        return 0;
    }
    (secs * 10.0).clamp(0.0, 255.0) as u8
}

/// ジェスチャー種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gesture {
    ButtonPress,
    ButtonRelease,
    RotateLeft,
    RotateRight,
    TouchLeftDown,
    TouchLeftRelease,
    TouchRightDown,
    TouchRightRelease,
    TouchTopDown,
    TouchTopRelease,
    TouchBottomDown,
    TouchBottomRelease,
    SwipeLeft,
    SwipeRight,
    SwipeUp,
    SwipeDown,
    FlyLeft,
    FlyRight,
    FlyBackwards,
    FlyTowards,
}

/// 旧ファームウェアのタッチ領域（ボタンビット i / 2 に対応）
const TOUCH_DOWN_GESTURES: [Gesture; 4] = [
    Gesture::TouchLeftDown,
    Gesture::TouchTopDown,
    Gesture::TouchRightDown,
    Gesture::TouchBottomDown,
];

impl Gesture {
    /// タッチダウンに対応するリリース
    pub fn touch_release(self) -> Option<Gesture> {
        match self {
            Gesture::TouchLeftDown | Gesture::TouchLeftRelease => Some(Gesture::TouchLeftRelease),
            Gesture::TouchRightDown | Gesture::TouchRightRelease => Some(Gesture::TouchRightRelease),
            Gesture::TouchTopDown | Gesture::TouchTopRelease => Some(Gesture::TouchTopRelease),
            Gesture::TouchBottomDown | Gesture::TouchBottomRelease => Some(Gesture::TouchBottomRelease),
            _ => None,
        }
    }

    /// タッチ領域に対応するスワイプ
    pub fn swipe(self) -> Option<Gesture> {
        match self {
            Gesture::TouchLeftDown | Gesture::TouchLeftRelease => Some(Gesture::SwipeLeft),
            Gesture::TouchRightDown | Gesture::TouchRightRelease => Some(Gesture::SwipeRight),
            Gesture::TouchTopDown | Gesture::TouchTopRelease => Some(Gesture::SwipeUp),
            Gesture::TouchBottomDown | Gesture::TouchBottomRelease => Some(Gesture::SwipeDown),
            _ => None,
        }
    }
}

/// センサー通知から得たジェスチャー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GestureEvent {
    pub gesture: Gesture,
    pub value: Option<i32>,
}

impl GestureEvent {
    pub fn new(gesture: Gesture, value: Option<i32>) -> Self {
        GestureEvent { gesture, value }
    }

    /// キャラクタリスティック通知をデコード
    ///
    /// 未知のキャラクタリスティックや解釈できない値は`None`。
    pub fn decode(characteristic: Uuid, value: &[u8]) -> Option<Self> {
        match characteristic {
            c if c == uuid::SENSOR_BUTTON_CHAR => {
                let pressed = *value.first()?;
                let gesture = if pressed == 1 { Gesture::ButtonPress } else { Gesture::ButtonRelease };
                Some(GestureEvent::new(gesture, Some(pressed as i32)))
            }
            c if c == uuid::SENSOR_ROTATION_CHAR => {
                let steps = read_i16(value, 0)? as i32;
                let gesture = if steps >= 0 { Gesture::RotateRight } else { Gesture::RotateLeft };
                Some(GestureEvent::new(gesture, Some(steps.abs())))
            }
            c if c == uuid::SENSOR_TOUCH_CHAR => decode_touch(value),
            c if c == uuid::SENSOR_FLY_CHAR => {
                if value.len() < 2 {
                    return None;
                }
                let gesture = match value[0] {
                    0 => Gesture::FlyLeft,
                    1 => Gesture::FlyRight,
                    2 => Gesture::FlyBackwards,
                    3 => Gesture::FlyTowards,
                    _ => return None,
                };
                Some(GestureEvent::new(gesture, Some(value[1] as i32)))
            }
            _ => None,
        }
    }
}

fn decode_touch(value: &[u8]) -> Option<GestureEvent> {
    if value.len() == 1 {
        let gesture = match value[0] {
            0 => Gesture::SwipeLeft,
            1 => Gesture::SwipeRight,
            2 => Gesture::SwipeUp,
            3 => Gesture::SwipeDown,
            _ => return None,
        };
        return Some(GestureEvent::new(gesture, Some(0)));
    }

    // 旧ファームウェア: ボタンビットマスク(i16) + イベント種別(i16)
    let buttons = read_i16(value, 0)?;
    let event = read_i16(value, 2)?;
    for i in 0..8 {
        if buttons & (1 << i) == 0 {
            continue;
        }
        let touch_down = TOUCH_DOWN_GESTURES[i / 2];
        let gesture = match event {
            1 => Some(touch_down),
            2 => touch_down.touch_release(),
            4 => touch_down.swipe(),
            _ => None,
        };
        if let Some(gesture) = gesture {
            return Some(GestureEvent::new(gesture, Some(i as i32)));
        }
    }
    None
}

fn read_i16(value: &[u8], offset: usize) -> Option<i16> {
    let bytes = value.get(offset..offset + 2)?;
    Some(i16::from_le_bytes([bytes[0], bytes[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_led_matrix_pattern() {
        let zero = LedMatrix::from_pattern(&" ".repeat(LED_COUNT));
        assert_eq!(zero.lit_count(), 0);

        let full = LedMatrix::from_pattern(&"1".repeat(LED_COUNT));
        assert_eq!(full.lit_count(), LED_COUNT);

        // 短いパターンは消灯で埋める
        let short = LedMatrix::from_pattern("111111111000000000");
        assert_eq!(short.lit_count(), 9);
        assert!(short.bits()[..9].iter().all(|b| *b));

        // 長いパターンは切り捨て
        let long = LedMatrix::from_pattern(&format!("{}{}", "1".repeat(LED_COUNT), "000000000"));
        assert_eq!(long, full);
    }

    #[test]
    fn test_led_matrix_gatt_bytes() {
        let matrix = LedMatrix::from_pattern("********        * * * * ");
        let bytes = matrix.gatt_bytes(2.0);

        assert_eq!(bytes.len(), 13);
        assert_eq!(&bytes[..11], &[0xFF, 0, 85, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(bytes[11], 0xFF); // 輝度
        assert_eq!(bytes[12], 20);   // 2.0秒
    }

    #[test]
    fn test_display_interval_is_clamped() {
        let matrix = LedMatrix::blank();
        assert_eq!(matrix.gatt_bytes(-1.0)[12], 0);
        assert_eq!(matrix.gatt_bytes(100.0)[12], 255);
    }

    #[test]
    fn test_busy_matrix() {
        let busy = LedMatrix::busy();
        assert_eq!(busy.lit_count(), 1);
        assert!(busy.bits()[0]);
    }

    #[test]
    fn test_decode_button() {
        let press = GestureEvent::decode(uuid::SENSOR_BUTTON_CHAR, &[1]).unwrap();
        assert_eq!(press.gesture, Gesture::ButtonPress);
        let release = GestureEvent::decode(uuid::SENSOR_BUTTON_CHAR, &[0]).unwrap();
        assert_eq!(release.gesture, Gesture::ButtonRelease);
        assert!(GestureEvent::decode(uuid::SENSOR_BUTTON_CHAR, &[]).is_none());
    }

    #[test]
    fn test_decode_rotation() {
        let right = GestureEvent::decode(uuid::SENSOR_ROTATION_CHAR, &42i16.to_le_bytes()).unwrap();
        assert_eq!(right, GestureEvent::new(Gesture::RotateRight, Some(42)));

        let left = GestureEvent::decode(uuid::SENSOR_ROTATION_CHAR, &(-300i16).to_le_bytes()).unwrap();
        assert_eq!(left, GestureEvent::new(Gesture::RotateLeft, Some(300)));
    }

    #[test]
    fn test_decode_touch() {
        let swipe = GestureEvent::decode(uuid::SENSOR_TOUCH_CHAR, &[2]).unwrap();
        assert_eq!(swipe.gesture, Gesture::SwipeUp);
        assert!(GestureEvent::decode(uuid::SENSOR_TOUCH_CHAR, &[9]).is_none());

        // 旧形式: ビット2（上）でタッチダウン
        let legacy = GestureEvent::decode(uuid::SENSOR_TOUCH_CHAR, &[0b0000_0100, 0, 1, 0]).unwrap();
        assert_eq!(legacy, GestureEvent::new(Gesture::TouchTopDown, Some(2)));

        // 旧形式: スワイプ
        let legacy_swipe = GestureEvent::decode(uuid::SENSOR_TOUCH_CHAR, &[0b0000_0001, 0, 4, 0]).unwrap();
        assert_eq!(legacy_swipe.gesture, Gesture::SwipeLeft);
    }

    #[test]
    fn test_decode_fly() {
        let fly = GestureEvent::decode(uuid::SENSOR_FLY_CHAR, &[3, 17]).unwrap();
        assert_eq!(fly, GestureEvent::new(Gesture::FlyTowards, Some(17)));
        assert!(GestureEvent::decode(uuid::SENSOR_FLY_CHAR, &[3]).is_none());
    }

    #[test]
    fn test_decode_unknown_characteristic() {
        assert!(GestureEvent::decode(uuid::BATTERY_CHAR, &[50]).is_none());
    }
}
